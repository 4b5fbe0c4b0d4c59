//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;

/// Detects sustained steps in a stream of noisy samples (e.g. RTT
/// measurements).
///
/// Two sliding windows run over the samples: a short one that reacts
/// quickly to large steps, and a long one that catches slow drifts. Each
/// full window's mean is compared against the current level; a deviation
/// above the window's relative threshold (and above the absolute
/// threshold) reports a step and re-seeds both windows at the new level.
#[derive(Debug)]
pub struct StepDetector {
    fast_window: VecDeque<u64>,
    slow_window: VecDeque<u64>,
    abs_threshold: u64,
    current: Option<u64>,
}

// ===== impl StepDetector =====

impl StepDetector {
    pub const FAST_WINDOW_SIZE: usize = 10;
    pub const SLOW_WINDOW_SIZE: usize = 60;
    // The long window uses the tighter threshold: more samples, more
    // confidence.
    pub const FAST_REL_THRESHOLD: f64 = 0.05;
    pub const SLOW_REL_THRESHOLD: f64 = 0.02;

    pub fn new(abs_threshold: u64) -> StepDetector {
        StepDetector {
            fast_window: VecDeque::with_capacity(Self::FAST_WINDOW_SIZE),
            slow_window: VecDeque::with_capacity(Self::SLOW_WINDOW_SIZE),
            abs_threshold,
            current: None,
        }
    }

    /// Feeds a new sample. Returns `Some(new_level)` when a step was
    /// detected.
    pub fn add_value(&mut self, value: u64) -> Option<u64> {
        push_bounded(&mut self.fast_window, value, Self::FAST_WINDOW_SIZE);
        push_bounded(&mut self.slow_window, value, Self::SLOW_WINDOW_SIZE);

        if self.fast_window.len() < Self::FAST_WINDOW_SIZE {
            return None;
        }
        let fast_mean = mean(&self.fast_window);

        // The first full fast window establishes the level.
        let current = match self.current {
            Some(current) => current,
            None => {
                self.current = Some(fast_mean);
                return Some(fast_mean);
            }
        };

        if self.exceeds(fast_mean, current, Self::FAST_REL_THRESHOLD) {
            return Some(self.step_to(fast_mean));
        }
        if self.slow_window.len() == Self::SLOW_WINDOW_SIZE {
            let slow_mean = mean(&self.slow_window);
            if self.exceeds(slow_mean, current, Self::SLOW_REL_THRESHOLD) {
                return Some(self.step_to(slow_mean));
            }
        }

        None
    }

    /// Returns the most recently reported level.
    pub fn current(&self) -> Option<u64> {
        self.current
    }

    fn exceeds(&self, mean: u64, current: u64, rel_threshold: f64) -> bool {
        let deviation = mean.abs_diff(current);
        deviation > self.abs_threshold
            && deviation as f64 > current as f64 * rel_threshold
    }

    fn step_to(&mut self, level: u64) -> u64 {
        self.current = Some(level);
        self.fast_window.clear();
        self.slow_window.clear();
        level
    }
}

// ===== helper functions =====

fn mean(window: &VecDeque<u64>) -> u64 {
    window.iter().sum::<u64>() / window.len() as u64
}

fn push_bounded(window: &mut VecDeque<u64>, value: u64, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(value);
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_signal_reports_once() {
        let mut detector = StepDetector::new(500);

        let mut reports = vec![];
        for _ in 0..120 {
            if let Some(level) = detector.add_value(10_000) {
                reports.push(level);
            }
        }
        assert_eq!(reports, vec![10_000]);
    }

    #[test]
    fn small_jitter_ignored() {
        let mut detector = StepDetector::new(500);
        for _ in 0..60 {
            detector.add_value(100_000);
        }

        // 0.3% wiggle stays below both thresholds.
        for i in 0..60 {
            let sample = 100_000 + (i % 2) * 300;
            assert_eq!(detector.add_value(sample), None);
        }
        assert_eq!(detector.current(), Some(100_000));
    }

    #[test]
    fn large_step_converges() {
        let mut detector = StepDetector::new(500);
        for _ in 0..60 {
            detector.add_value(10_000);
        }

        let mut last = None;
        for _ in 0..30 {
            if let Some(level) = detector.add_value(20_000) {
                last = Some(level);
            }
        }
        assert_eq!(last, Some(20_000));
    }

    #[test]
    fn slow_drift_detected() {
        let mut detector = StepDetector::new(100);
        for _ in 0..60 {
            detector.add_value(100_000);
        }

        // A 3% shift is below the fast threshold but above the slow one.
        let mut stepped = false;
        for _ in 0..120 {
            if detector.add_value(103_000).is_some() {
                stepped = true;
                break;
            }
        }
        assert!(stepped);
    }
}
