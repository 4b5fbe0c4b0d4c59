//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{Publication, Value};

/// Token bucket limiting outbound flood publications.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst_size: f64,
    tokens: f64,
    last_refill: Instant,
}

/// Outbound flood queue.
///
/// Publications beyond the token budget are buffered here; multiple
/// pending updates for the same key collapse to the latest one.
#[derive(Debug, Default)]
pub struct FloodBuffer {
    pending: BTreeMap<String, PendingUpdate>,
}

#[derive(Debug)]
struct PendingUpdate {
    value: Value,
    node_ids: Option<Vec<String>>,
}

// ===== impl TokenBucket =====

impl TokenBucket {
    pub fn new(rate_per_sec: u32, burst_size: u32) -> TokenBucket {
        TokenBucket {
            rate_per_sec: rate_per_sec as f64,
            burst_size: burst_size as f64,
            tokens: burst_size as f64,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token if available.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token becomes available.
    pub fn time_until_available(&self, now: Instant) -> Duration {
        let tokens = self.project_tokens(now);
        if tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - tokens) / self.rate_per_sec)
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.project_tokens(now);
        self.last_refill = now;
    }

    fn project_tokens(&self, now: Instant) -> f64 {
        let elapsed =
            now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.rate_per_sec).min(self.burst_size)
    }
}

// ===== impl FloodBuffer =====

impl FloodBuffer {
    /// Buffers updates for later flooding. An update for an already
    /// pending key replaces it, keeping only the newest value and its
    /// path vector.
    pub fn push(
        &mut self,
        key_vals: BTreeMap<String, Value>,
        node_ids: Option<Vec<String>>,
    ) {
        for (key, value) in key_vals {
            self.pending.insert(
                key,
                PendingUpdate {
                    value,
                    node_ids: node_ids.clone(),
                },
            );
        }
    }

    /// Drains everything pending into publications, one per distinct
    /// path vector.
    pub fn drain(&mut self) -> Vec<Publication> {
        let mut grouped: BTreeMap<Option<Vec<String>>, Publication> =
            BTreeMap::new();
        for (key, update) in std::mem::take(&mut self.pending) {
            let publication =
                grouped.entry(update.node_ids.clone()).or_default();
            publication.key_vals.insert(key, update.value);
            publication.node_ids = update.node_ids;
        }
        grouped.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn value(version: u64, bytes: &'static [u8]) -> Value {
        Value::new(version, "node1", Bytes::from_static(bytes), 3_600_000)
    }

    #[test]
    fn bucket_enforces_burst_and_rate() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 3);

        assert!(bucket.try_consume(now));
        assert!(bucket.try_consume(now));
        assert!(bucket.try_consume(now));
        assert!(!bucket.try_consume(now));

        // One token accrues every 100ms.
        let later = now + Duration::from_millis(150);
        assert!(bucket.try_consume(later));
        assert!(!bucket.try_consume(later));
        assert!(bucket.time_until_available(later) > Duration::ZERO);
    }

    #[test]
    fn buffer_coalesces_same_key() {
        let mut buffer = FloodBuffer::default();
        buffer.push(
            BTreeMap::from([("k".to_owned(), value(1, b"old"))]),
            None,
        );
        buffer.push(
            BTreeMap::from([("k".to_owned(), value(2, b"new"))]),
            None,
        );

        let publications = buffer.drain();
        assert_eq!(publications.len(), 1);
        assert_eq!(publications[0].key_vals["k"].version, 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_groups_by_path_vector() {
        let mut buffer = FloodBuffer::default();
        buffer.push(
            BTreeMap::from([("k1".to_owned(), value(1, b"a"))]),
            Some(vec!["node9".to_owned()]),
        );
        buffer.push(
            BTreeMap::from([("k2".to_owned(), value(1, b"b"))]),
            None,
        );

        let publications = buffer.drain();
        assert_eq!(publications.len(), 2);
    }
}
