//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// Sentinel TTL meaning "never expires".
pub const TTL_INFINITY: i64 = i64::MAX;

/// One versioned record of the replicated store.
///
/// Records are ordered by the `(version, originator_id, hash)` tuple; a
/// strictly higher tuple wins everywhere. For an equal tuple, a higher
/// `ttl_version` refreshes the record's TTL without touching its bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Value {
    // Monotonically increasing per key.
    pub version: u64,
    // Node that originated this record.
    pub originator_id: String,
    // Record payload. Absent on TTL-only refreshes.
    pub value: Option<Bytes>,
    // Time to live in milliseconds, or `TTL_INFINITY`.
    pub ttl: i64,
    // Bumped on every TTL refresh.
    pub ttl_version: u64,
    // Content digest over (version, originator_id, value).
    pub hash: Option<i64>,
}

/// Result of merging one incoming record against the local one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeOutcome {
    // Incoming record is strictly newer; stored and scheduled for flood.
    Updated,
    // Same tuple with a higher ttl_version; TTL refreshed in place.
    TtlRefreshed,
    // Same tuple and ttl_version; nothing to do.
    Duplicate,
    // Incoming record is older than the local one.
    Stale,
    // Record was rejected by the store's filters or failed validation.
    Rejected,
}

/// Batch of updates exchanged between stores and delivered to
/// subscribers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Publication {
    pub key_vals: BTreeMap<String, Value>,
    // Keys that expired and were removed.
    pub expired_keys: Vec<String>,
    // Path vector used to suppress flooding loops.
    pub node_ids: Option<Vec<String>>,
}

/// Parameters for `set_keys`.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct KeySetParams {
    pub key_vals: BTreeMap<String, Value>,
    // When set, the caller wants stores holding newer values to push
    // them back.
    pub solicit_response: bool,
    // Path vector carried over from an inbound publication.
    pub node_ids: Option<Vec<String>>,
    // Keep refreshing the TTL of these records while this store runs.
    // Tombstones leave this unset so the TTL can collect them.
    pub refresh_ttl: bool,
}

/// Parameters for filtered dumps. A key matches when its name starts
/// with one of the prefixes or its originator is listed; an empty
/// filter matches everything.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct KeyDumpParams {
    pub prefix: Option<String>,
    pub originator_ids: BTreeSet<String>,
    // Skip keys whose stored tuple matches the provided digest entry.
    pub key_val_hashes: Option<BTreeMap<String, ValueDigest>>,
}

/// Compact per-key digest used by full-sync and hash dumps.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ValueDigest {
    pub version: u64,
    pub originator_id: String,
    pub hash: i64,
}

/// Key-space filters for leaf stores: only records whose key matches a
/// configured prefix, or whose originator is allowlisted, are accepted
/// and forwarded.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct KvFilters {
    pub key_prefixes: Vec<String>,
    pub originator_ids: BTreeSet<String>,
}

/// Endpoints of one configured peer.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PeerSpec {
    // Endpoint the peer floods publications from.
    pub pub_addr: SocketAddr,
    // Endpoint the peer answers sync requests on.
    pub cmd_addr: SocketAddr,
}

/// Per-peer state reported by `get_peers`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PeerInfo {
    pub spec: PeerSpec,
    pub initial_sync_done: bool,
}

/// Per-root spanning tree state reported by `get_spanning_tree_infos`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct SptInfo {
    pub root: String,
    // False while a diffusing computation is in progress.
    pub passive: bool,
    pub cost: u64,
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
}

/// Store event counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct KvStoreCounters {
    pub received_publications: u64,
    pub received_key_vals: u64,
    pub updated_key_vals: u64,
    pub expired_keys: u64,
    pub flood_suppressions: u64,
    pub full_sync_rounds: u64,
    pub malformed_records: u64,
}

// ===== impl Value =====

impl Value {
    pub fn new(
        version: u64,
        originator_id: impl Into<String>,
        value: Bytes,
        ttl: i64,
    ) -> Value {
        let originator_id = originator_id.into();
        let hash = content_hash(version, &originator_id, &value);
        Value {
            version,
            originator_id,
            value: Some(value),
            ttl,
            ttl_version: 0,
            hash: Some(hash),
        }
    }

    /// Returns the content hash, computing it from the stored bytes when
    /// the originator didn't provide one.
    pub fn hash_or_compute(&self) -> Option<i64> {
        match (self.hash, &self.value) {
            (Some(hash), _) => Some(hash),
            (None, Some(value)) => Some(content_hash(
                self.version,
                &self.originator_id,
                value,
            )),
            (None, None) => None,
        }
    }

    /// Returns whether this record carries no payload and only refreshes
    /// the TTL of an existing one.
    pub fn is_ttl_update(&self) -> bool {
        self.value.is_none()
    }

    pub fn digest(&self) -> ValueDigest {
        ValueDigest {
            version: self.version,
            originator_id: self.originator_id.clone(),
            hash: self.hash_or_compute().unwrap_or(0),
        }
    }
}

// ===== impl Publication =====

impl Publication {
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

// ===== impl KeyDumpParams =====

impl KeyDumpParams {
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        let prefix_match = match &self.prefix {
            Some(prefix) => key.starts_with(prefix.as_str()),
            None => self.originator_ids.is_empty(),
        };
        prefix_match || self.originator_ids.contains(&value.originator_id)
    }
}

// ===== impl KvFilters =====

impl KvFilters {
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        self.key_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
            || self.originator_ids.contains(&value.originator_id)
    }
}

// ===== global functions =====

/// 64-bit digest over a record's identity and payload, used for cheap
/// equality checks during sync.
pub fn content_hash(
    version: u64,
    originator_id: &str,
    value: &Bytes,
) -> i64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&version.to_be_bytes());
    hasher.update(originator_id.as_bytes());
    hasher.update(value);
    let digest = hasher.finalize();
    i64::from_be_bytes(digest.as_bytes()[..8].try_into().unwrap())
}
