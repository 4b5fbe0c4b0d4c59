//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::{
    KeyDumpParams, KvFilters, KvStoreCounters, MergeOutcome, Publication,
    Value, ValueDigest, TTL_INFINITY,
};

/// The replicated map of one area, with TTL bookkeeping.
///
/// This is pure state: all I/O (flooding, timers) is driven by the store
/// task around it.
#[derive(Debug, Default)]
pub struct KeyValueMap {
    key_vals: BTreeMap<String, KvEntry>,
    // Keys this node originated, refreshed before they can expire.
    self_originated: BTreeMap<String, Instant>,
    filters: Option<KvFilters>,
    counters: KvStoreCounters,
}

#[derive(Debug)]
struct KvEntry {
    value: Value,
    // Absent for records with infinite TTL.
    expires_at: Option<Instant>,
}

// ===== impl KeyValueMap =====

impl KeyValueMap {
    pub fn new(filters: Option<KvFilters>) -> KeyValueMap {
        KeyValueMap {
            filters,
            ..Default::default()
        }
    }

    /// Merges a batch of incoming records. Returns the accepted updates
    /// (for flooding and subscriber notification) and the TTL-only
    /// refreshes (forwarded but not notified).
    pub fn merge_key_values(
        &mut self,
        key_vals: BTreeMap<String, Value>,
        now: Instant,
    ) -> MergeResult {
        let mut result = MergeResult::default();
        self.counters.received_key_vals += key_vals.len() as u64;

        for (key, v_in) in key_vals {
            match self.merge_one(&key, v_in, now) {
                MergeOutcome::Updated => {
                    let value = self.key_vals[&key].value.clone();
                    result.updates.insert(key, value);
                }
                MergeOutcome::TtlRefreshed => {
                    let value = &self.key_vals[&key].value;
                    // Forward the refresh without the payload.
                    let mut refresh = value.clone();
                    refresh.value = None;
                    result.ttl_refreshes.insert(key, refresh);
                }
                MergeOutcome::Stale => {
                    // Let the sender catch up.
                    let value = self.key_vals[&key].value.clone();
                    result.newer_than_sender.insert(key, value);
                }
                MergeOutcome::Duplicate => (),
                MergeOutcome::Rejected => {
                    self.counters.malformed_records += 1;
                }
            }
        }

        self.counters.updated_key_vals += result.updates.len() as u64;
        result
    }

    fn merge_one(
        &mut self,
        key: &str,
        v_in: Value,
        now: Instant,
    ) -> MergeOutcome {
        // Basic validation.
        if v_in.ttl != TTL_INFINITY && v_in.ttl <= 0 {
            return MergeOutcome::Rejected;
        }
        if let Some(filters) = &self.filters {
            if !filters.matches(key, &v_in) {
                return MergeOutcome::Rejected;
            }
        }

        let expires_at = expiry(&v_in, now);
        match self.key_vals.entry(key.to_owned()) {
            Entry::Vacant(entry) => {
                // A TTL update for a key we don't hold is useless.
                if v_in.is_ttl_update() {
                    return MergeOutcome::Rejected;
                }
                let mut v_in = v_in;
                v_in.hash = v_in.hash_or_compute();
                entry.insert(KvEntry {
                    value: v_in,
                    expires_at,
                });
                MergeOutcome::Updated
            }
            Entry::Occupied(mut entry) => {
                let v_loc = &entry.get().value;
                match compare_values(&v_in, v_loc) {
                    Ordering::Greater => {
                        // TTL-only updates never overwrite stored bytes,
                        // so a newer tuple needs a payload to win.
                        if v_in.is_ttl_update() {
                            return MergeOutcome::Rejected;
                        }
                        let mut v_in = v_in;
                        v_in.hash = v_in.hash_or_compute();
                        entry.insert(KvEntry {
                            value: v_in,
                            expires_at,
                        });
                        MergeOutcome::Updated
                    }
                    Ordering::Equal
                        if v_in.ttl_version > v_loc.ttl_version =>
                    {
                        let entry = entry.get_mut();
                        entry.value.ttl_version = v_in.ttl_version;
                        entry.value.ttl = v_in.ttl;
                        entry.expires_at = expiry(&entry.value, now);
                        MergeOutcome::TtlRefreshed
                    }
                    Ordering::Equal
                        if v_in.ttl_version == v_loc.ttl_version =>
                    {
                        MergeOutcome::Duplicate
                    }
                    _ => MergeOutcome::Stale,
                }
            }
        }
    }

    /// Marks a key as self-originated so its TTL gets refreshed locally.
    pub fn track_self_originated(&mut self, key: String, now: Instant) {
        if let Some(entry) = self.key_vals.get(&key) {
            if entry.value.ttl != TTL_INFINITY {
                // Refresh at a quarter of the TTL before expiry.
                let refresh_at = now
                    + Duration::from_millis(
                        (entry.value.ttl - entry.value.ttl / 4) as u64,
                    );
                self.self_originated.insert(key, refresh_at);
            }
        }
    }

    pub fn untrack_self_originated(&mut self, key: &str) {
        self.self_originated.remove(key);
    }

    /// Returns the next instant at which TTL work (expiry or refresh) is
    /// due.
    pub fn next_ttl_deadline(&self) -> Option<Instant> {
        let next_expiry = self
            .key_vals
            .values()
            .filter_map(|entry| entry.expires_at)
            .min();
        let next_refresh = self.self_originated.values().copied().min();
        [next_expiry, next_refresh].into_iter().flatten().min()
    }

    /// Removes every record whose TTL elapsed and returns the expired
    /// keys.
    pub fn expire_due(&mut self, now: Instant) -> Vec<String> {
        let expired = self
            .key_vals
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.expires_at, Some(at) if at <= now)
            })
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for key in &expired {
            debug!(%key, "record expired");
            self.key_vals.remove(key);
            self.self_originated.remove(key);
        }
        self.counters.expired_keys += expired.len() as u64;
        expired
    }

    /// Bumps the ttl_version of every self-originated key due for a
    /// refresh and returns the TTL-only records to advertise.
    pub fn refresh_due(
        &mut self,
        now: Instant,
    ) -> BTreeMap<String, Value> {
        let due = self
            .self_originated
            .iter()
            .filter(|(_, refresh_at)| **refresh_at <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        let mut refreshes = BTreeMap::new();
        for key in due {
            let Some(entry) = self.key_vals.get_mut(&key) else {
                self.self_originated.remove(&key);
                continue;
            };
            entry.value.ttl_version += 1;
            entry.expires_at = expiry(&entry.value, now);

            let mut refresh = entry.value.clone();
            refresh.value = None;
            refreshes.insert(key.clone(), refresh);

            self.track_self_originated(key, now);
        }
        refreshes
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.key_vals.get(key).map(|entry| &entry.value)
    }

    /// Filtered dump of full records.
    pub fn dump(
        &self,
        params: &KeyDumpParams,
    ) -> BTreeMap<String, Value> {
        self.key_vals
            .iter()
            .filter(|(key, entry)| params.matches(key, &entry.value))
            .filter(|(key, entry)| match &params.key_val_hashes {
                Some(digests) => digests
                    .get(*key)
                    .map(|digest| entry.value.digest() != *digest)
                    .unwrap_or(true),
                None => true,
            })
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Filtered dump with payloads omitted, for cheap comparison.
    pub fn dump_hashes(
        &self,
        params: &KeyDumpParams,
    ) -> BTreeMap<String, Value> {
        self.dump(params)
            .into_iter()
            .map(|(key, mut value)| {
                value.value = None;
                (key, value)
            })
            .collect()
    }

    /// Digest of the whole map, exchanged during full-sync.
    pub fn digest(&self) -> BTreeMap<String, ValueDigest> {
        self.key_vals
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.digest()))
            .collect()
    }

    /// Returns the keys of `their_digest` that are stale or missing
    /// compared to this map.
    pub fn stale_keys(
        &self,
        their_digest: &BTreeMap<String, ValueDigest>,
    ) -> Vec<String> {
        self.key_vals
            .iter()
            .filter(|(key, entry)| match their_digest.get(*key) {
                Some(theirs) => {
                    digest_cmp(&entry.value.digest(), theirs)
                        == Ordering::Greater
                }
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.key_vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty()
    }

    pub fn counters(&self) -> KvStoreCounters {
        self.counters
    }

    pub fn counters_mut(&mut self) -> &mut KvStoreCounters {
        &mut self.counters
    }
}

/// Outcome of one merge batch.
#[derive(Debug, Default)]
pub struct MergeResult {
    // Accepted new records, to flood and publish.
    pub updates: BTreeMap<String, Value>,
    // Accepted TTL refreshes, forwarded without local notification.
    pub ttl_refreshes: BTreeMap<String, Value>,
    // Records where the sender was behind, pushed back on request.
    pub newer_than_sender: BTreeMap<String, Value>,
}

// ===== global functions =====

/// Total order between two records of the same key: `(version,
/// originator_id, content hash)` compared lexicographically. `Equal`
/// means the records carry identical content (TTL metadata aside).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.originator_id.cmp(&b.originator_id))
        .then_with(|| {
            match (a.hash_or_compute(), b.hash_or_compute()) {
                (Some(ha), Some(hb)) => ha.cmp(&hb),
                // A TTL-only update compares equal on content.
                _ => Ordering::Equal,
            }
        })
}

fn digest_cmp(a: &ValueDigest, b: &ValueDigest) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.originator_id.cmp(&b.originator_id))
        .then_with(|| a.hash.cmp(&b.hash))
}

fn expiry(value: &Value, now: Instant) -> Option<Instant> {
    (value.ttl != TTL_INFINITY)
        .then(|| now + Duration::from_millis(value.ttl as u64))
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use bytes::Bytes;

    use super::*;

    fn value(version: u64, originator: &str, bytes: &'static [u8]) -> Value {
        Value::new(version, originator, Bytes::from_static(bytes), 3_600_000)
    }

    fn merge_seq(values: Vec<(&str, Value)>) -> KeyValueMap {
        let now = Instant::now();
        let mut map = KeyValueMap::default();
        for (key, value) in values {
            map.merge_key_values(
                BTreeMap::from([(key.to_owned(), value)]),
                now,
            );
        }
        map
    }

    #[test]
    fn higher_version_wins() {
        let now = Instant::now();
        let mut map = KeyValueMap::default();

        let result = map.merge_key_values(
            BTreeMap::from([("k".to_owned(), value(1, "node1", b"a"))]),
            now,
        );
        assert_eq!(result.updates.len(), 1);

        let result = map.merge_key_values(
            BTreeMap::from([("k".to_owned(), value(2, "node1", b"b"))]),
            now,
        );
        assert_eq!(result.updates.len(), 1);
        assert_eq!(map.get("k").unwrap().version, 2);

        // Downgrade attempt is reported back as stale.
        let result = map.merge_key_values(
            BTreeMap::from([("k".to_owned(), value(1, "node1", b"c"))]),
            now,
        );
        assert!(result.updates.is_empty());
        assert_eq!(result.newer_than_sender.len(), 1);
        assert_eq!(map.get("k").unwrap().version, 2);
    }

    #[test]
    fn originator_breaks_version_tie() {
        let map = merge_seq(vec![
            ("k", value(1, "node2", b"a")),
            ("k", value(1, "node1", b"b")),
        ]);
        assert_eq!(map.get("k").unwrap().originator_id, "node2");
    }

    #[test]
    fn merge_is_commutative() {
        let a = value(3, "node1", b"aaa");
        let b = value(3, "node2", b"bbb");
        let c = value(2, "node9", b"ccc");

        let map1 = merge_seq(vec![
            ("k", a.clone()),
            ("k", b.clone()),
            ("k", c.clone()),
        ]);
        let map2 = merge_seq(vec![("k", c), ("k", b), ("k", a)]);
        assert_eq!(map1.get("k"), map2.get("k"));
    }

    #[test]
    fn ttl_update_never_replaces_value() {
        let now = Instant::now();
        let mut map = KeyValueMap::default();
        map.merge_key_values(
            BTreeMap::from([("k".to_owned(), value(1, "node1", b"data"))]),
            now,
        );

        // TTL refresh for the same tuple.
        let stored = map.get("k").unwrap().clone();
        let refresh = Value {
            value: None,
            ttl_version: 5,
            ..stored.clone()
        };
        let result = map.merge_key_values(
            BTreeMap::from([("k".to_owned(), refresh)]),
            now,
        );
        assert!(result.updates.is_empty());
        assert_eq!(result.ttl_refreshes.len(), 1);
        let after = map.get("k").unwrap();
        assert_eq!(after.value, stored.value);
        assert_eq!(after.ttl_version, 5);

        // A TTL update claiming a newer version must not clobber the
        // stored payload either.
        let bogus = Value {
            version: 9,
            value: None,
            hash: None,
            ..stored.clone()
        };
        map.merge_key_values(
            BTreeMap::from([("k".to_owned(), bogus)]),
            now,
        );
        assert_eq!(map.get("k").unwrap().version, 1);
        assert_eq!(map.get("k").unwrap().value, stored.value);
    }

    #[test]
    fn records_expire() {
        let now = Instant::now();
        let mut map = KeyValueMap::default();
        let mut v = value(1, "node1", b"x");
        v.ttl = 100;
        map.merge_key_values(BTreeMap::from([("k".to_owned(), v)]), now);

        assert!(map.next_ttl_deadline().is_some());
        assert!(map.expire_due(now).is_empty());

        let expired = map.expire_due(now + Duration::from_millis(150));
        assert_eq!(expired, vec!["k".to_owned()]);
        assert!(map.get("k").is_none());
    }

    #[test]
    fn self_originated_refresh() {
        let now = Instant::now();
        let mut map = KeyValueMap::default();
        let mut v = value(1, "node1", b"x");
        v.ttl = 1000;
        map.merge_key_values(
            BTreeMap::from([("k".to_owned(), v)]),
            now,
        );
        map.track_self_originated("k".to_owned(), now);

        // Refresh comes due before expiry.
        let refreshes = map.refresh_due(now + Duration::from_millis(800));
        assert_eq!(refreshes.len(), 1);
        let refresh = &refreshes["k"];
        assert_eq!(refresh.ttl_version, 1);
        assert!(refresh.value.is_none());

        // The record itself retains its payload.
        assert!(map.get("k").unwrap().value.is_some());
    }

    #[test]
    fn filtered_dump() {
        let now = Instant::now();
        let mut map = KeyValueMap::default();
        let keys: &[(&str, &str)] = &[
            ("key1", "node1"),
            ("key11", "node11"),
            ("key111", "node111"),
            ("key2", "node2"),
            ("key22", "node22"),
            ("key222", "node222"),
            ("key3", "node3"),
            ("key33", "node33"),
            ("key333", "node333"),
        ];
        for (key, originator) in keys {
            map.merge_key_values(
                BTreeMap::from([(
                    key.to_string(),
                    value(1, originator, b"v"),
                )]),
                now,
            );
        }

        // Prefix match wins regardless of originator.
        let params = KeyDumpParams {
            prefix: Some("key3".to_owned()),
            originator_ids: BTreeSet::from(["node3".to_owned()]),
            key_val_hashes: None,
        };
        let dump = map.dump(&params);
        assert_eq!(
            dump.keys().cloned().collect::<Vec<_>>(),
            vec!["key3", "key33", "key333"]
        );

        // Hash dump returns the same keys with payloads stripped.
        let hashes = map.dump_hashes(&params);
        assert_eq!(
            hashes.keys().cloned().collect::<Vec<_>>(),
            vec!["key3", "key33", "key333"]
        );
        assert!(hashes.values().all(|value| value.value.is_none()));
        assert!(hashes.values().all(|value| value.hash.is_some()));
    }

    #[test]
    fn digest_sync_detects_staleness() {
        let now = Instant::now();
        let mut map_a = KeyValueMap::default();
        let mut map_b = KeyValueMap::default();

        map_a.merge_key_values(
            BTreeMap::from([
                ("k1".to_owned(), value(2, "node1", b"new")),
                ("k2".to_owned(), value(1, "node1", b"same")),
            ]),
            now,
        );
        map_b.merge_key_values(
            BTreeMap::from([
                ("k1".to_owned(), value(1, "node1", b"old")),
                ("k2".to_owned(), value(1, "node1", b"same")),
            ]),
            now,
        );

        // B is stale on k1 only; k3 exists nowhere.
        let stale = map_a.stale_keys(&map_b.digest());
        assert_eq!(stale, vec!["k1".to_owned()]);
    }
}
