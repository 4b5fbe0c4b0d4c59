//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::{Duration, Instant};

/// Counts events over a sliding time window split into fixed-size buckets.
///
/// Buckets older than the window are lazily zeroed as time advances, so
/// the structure has constant memory and O(buckets) worst-case update
/// cost. Used for per-source packet rate accounting.
#[derive(Debug)]
pub struct BucketedTimeSeries {
    buckets: Vec<u64>,
    bucket_duration: Duration,
    origin: Instant,
    last_bucket: u64,
}

// ===== impl BucketedTimeSeries =====

impl BucketedTimeSeries {
    pub fn new(
        window: Duration,
        num_buckets: usize,
    ) -> BucketedTimeSeries {
        BucketedTimeSeries {
            buckets: vec![0; num_buckets],
            bucket_duration: window / num_buckets as u32,
            origin: Instant::now(),
            last_bucket: 0,
        }
    }

    /// Records one event at time `now`.
    pub fn add_value(&mut self, now: Instant) {
        let bucket = self.advance(now);
        let index = (bucket % self.buckets.len() as u64) as usize;
        self.buckets[index] += 1;
    }

    /// Returns the number of events recorded within the window ending at
    /// `now`.
    pub fn count(&mut self, now: Instant) -> u64 {
        self.advance(now);
        self.buckets.iter().sum()
    }

    // Zeroes every bucket that fell out of the window since the last
    // update and returns the current bucket number.
    fn advance(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        let bucket = (elapsed.as_nanos()
            / self.bucket_duration.as_nanos().max(1))
            as u64;

        let num_buckets = self.buckets.len() as u64;
        if bucket > self.last_bucket {
            let stale = (bucket - self.last_bucket).min(num_buckets);
            for offset in 0..stale {
                let index =
                    ((self.last_bucket + 1 + offset) % num_buckets) as usize;
                self.buckets[index] = 0;
            }
            self.last_bucket = bucket;
        }
        bucket
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_within_window() {
        let now = Instant::now();
        let mut series =
            BucketedTimeSeries::new(Duration::from_secs(1), 10);

        for _ in 0..5 {
            series.add_value(now);
        }
        assert_eq!(series.count(now), 5);

        // Still within the window.
        let later = now + Duration::from_millis(500);
        series.add_value(later);
        assert_eq!(series.count(later), 6);
    }

    #[test]
    fn old_events_expire() {
        let now = Instant::now();
        let mut series =
            BucketedTimeSeries::new(Duration::from_secs(1), 10);

        for _ in 0..5 {
            series.add_value(now);
        }

        // Two windows later, everything has aged out.
        let later = now + Duration::from_secs(2);
        assert_eq!(series.count(later), 0);
    }
}
