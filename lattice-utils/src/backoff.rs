//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::{Duration, Instant};

/// Reusable exponential backoff state machine.
///
/// Consumers report successes and failures; the backoff doubles on each
/// failure between the configured bounds and clears on success. Time is
/// tracked internally so callers only need to ask `can_try_now`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    init_backoff: Duration,
    max_backoff: Duration,
    current_backoff: Duration,
    last_error: Option<Instant>,
}

// ===== impl ExponentialBackoff =====

impl ExponentialBackoff {
    pub fn new(
        init_backoff: Duration,
        max_backoff: Duration,
    ) -> ExponentialBackoff {
        ExponentialBackoff {
            init_backoff,
            max_backoff,
            current_backoff: Duration::ZERO,
            last_error: None,
        }
    }

    /// Returns whether enough time has elapsed since the last reported
    /// error for another attempt.
    pub fn can_try_now(&self) -> bool {
        self.time_until_retry().is_zero()
    }

    /// Doubles the current backoff period, bounded by the configured
    /// maximum.
    pub fn report_error(&mut self) {
        self.current_backoff = if self.current_backoff.is_zero() {
            self.init_backoff
        } else {
            std::cmp::min(self.current_backoff * 2, self.max_backoff)
        };
        self.last_error = Some(Instant::now());
    }

    /// Clears the backoff state.
    pub fn report_success(&mut self) {
        self.current_backoff = Duration::ZERO;
        self.last_error = None;
    }

    /// Returns the time remaining until the next attempt is allowed.
    pub fn time_until_retry(&self) -> Duration {
        match self.last_error {
            Some(last_error) => (last_error + self.current_backoff)
                .saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Returns whether the backoff has reached its configured maximum.
    pub fn is_maxed_out(&self) -> bool {
        self.current_backoff >= self.max_backoff
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_progression() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(400),
        );
        assert!(backoff.can_try_now());

        backoff.report_error();
        assert!(!backoff.can_try_now());
        assert!(backoff.time_until_retry() <= Duration::from_millis(100));

        backoff.report_error();
        assert!(backoff.time_until_retry() <= Duration::from_millis(200));

        // Bounded by the maximum.
        backoff.report_error();
        backoff.report_error();
        backoff.report_error();
        assert!(backoff.is_maxed_out());
        assert!(backoff.time_until_retry() <= Duration::from_millis(400));

        backoff.report_success();
        assert!(backoff.can_try_now());
        assert!(!backoff.is_maxed_out());
    }
}
