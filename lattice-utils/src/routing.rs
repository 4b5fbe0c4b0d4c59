//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::mpls::{Label, LabelAction};
use crate::Area;

/// One directed adjacency advertised by a node.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Adjacency {
    pub other_node_name: String,
    pub other_if_name: String,
    pub if_name: String,
    pub metric: u32,
    // Label the advertising node assigned to this adjacency.
    pub adj_label: Label,
    pub is_overloaded: bool,
    pub rtt_us: Option<u64>,
    // When the adjacency was established, unix seconds.
    pub timestamp: i64,
    pub weight: u32,
    pub v4_addr: Option<IpAddr>,
    pub v6_addr: Option<IpAddr>,
}

/// A node's full adjacency advertisement, stored in the KvStore under
/// `adj:<node>[:<area>]`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AdjacencyDatabase {
    pub this_node_name: String,
    pub is_overloaded: bool,
    pub node_label: u32,
    pub adjacencies: Vec<Adjacency>,
}

/// Where a prefix advertisement came from.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum PrefixType {
    Loopback,
    Client,
    Bgp,
    Default,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ForwardingType {
    #[default]
    Ip,
    SrMpls,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ForwardingAlgorithm {
    #[default]
    SpEcmp,
    Ksp2EdEcmp,
}

/// One advertised prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PrefixEntry {
    pub prefix: IpNetwork,
    pub prefix_type: PrefixType,
    pub data: Bytes,
    pub forwarding_type: ForwardingType,
    pub forwarding_algorithm: ForwardingAlgorithm,
    pub ephemeral: bool,
    pub metric_vector: Option<MetricVector>,
}

/// A node's prefix advertisement, stored in the KvStore under
/// `prefix:<node>:<area>[:<ip>/<plen>]`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PrefixDatabase {
    pub this_node_name: String,
    pub prefix_entries: Vec<PrefixEntry>,
    // Tombstone: the advertisement is being withdrawn and the record
    // only lingers until its TTL runs out.
    pub delete_prefix: bool,
}

/// Ordered collection of metric entities compared lexicographically by
/// descending priority when electing the best prefix advertisement.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MetricVector {
    pub metrics: Vec<MetricEntity>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MetricEntity {
    // Entities are compared highest priority first.
    pub priority: i64,
    pub metric: i64,
    // How a comparison treats an entity the other side lacks.
    pub op: MetricEntityOp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MetricEntityOp {
    WinIfPresent,
    WinIfNotPresent,
    IgnoreIfNotPresent,
}

/// Next-hop of a computed route.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NextHop {
    pub address: IpAddr,
    pub if_name: String,
    pub metric: u32,
    pub mpls_action: Option<LabelAction>,
    pub use_non_shortest_route: bool,
}

/// Computed routes for every reachable destination.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteDatabase {
    pub unicast_routes: BTreeMap<IpNetwork, Vec<NextHop>>,
    pub mpls_routes: BTreeMap<Label, Vec<NextHop>>,
}

/// Difference between two consecutive route databases.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteDatabaseDelta {
    pub unicast_routes_to_update: BTreeMap<IpNetwork, Vec<NextHop>>,
    pub unicast_routes_to_delete: Vec<IpNetwork>,
    pub mpls_routes_to_update: BTreeMap<Label, Vec<NextHop>>,
    pub mpls_routes_to_delete: Vec<Label>,
    pub perf_events: PerfEvents,
}

/// Timestamped markers of one computation run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PerfEvents {
    pub node_name: String,
    pub events: Vec<PerfEvent>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PerfEvent {
    pub event_name: String,
    pub unix_ts_ms: u64,
}

// ===== impl RouteDatabaseDelta =====

impl RouteDatabaseDelta {
    pub fn is_empty(&self) -> bool {
        self.unicast_routes_to_update.is_empty()
            && self.unicast_routes_to_delete.is_empty()
            && self.mpls_routes_to_update.is_empty()
            && self.mpls_routes_to_delete.is_empty()
    }
}

// ===== impl PerfEvents =====

impl PerfEvents {
    pub fn mark(&mut self, event_name: &str) {
        let unix_ts_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        self.events.push(PerfEvent {
            event_name: event_name.to_owned(),
            unix_ts_ms,
        });
    }
}

// ===== global functions =====

/// KvStore key of a node's adjacency database.
pub fn adj_key(node_name: &str, area: &Area) -> String {
    format!("adj:{}:{}", node_name, area)
}

/// KvStore key of a node's whole-database prefix advertisement.
pub fn prefix_key(node_name: &str, area: &Area) -> String {
    format!("prefix:{}:{}", node_name, area)
}

/// KvStore key of a per-prefix advertisement.
pub fn per_prefix_key(
    node_name: &str,
    area: &Area,
    prefix: &IpNetwork,
) -> String {
    format!("prefix:{}:{}:[{}]", node_name, area, prefix)
}

/// Parses the node name out of an `adj:` or `prefix:` key.
pub fn parse_originator(key: &str) -> Option<&str> {
    key.split(':').nth(1).filter(|node| !node.is_empty())
}

/// Returns whether the key belongs to the routing key space consumed by
/// the decision engine.
pub fn is_routing_key(key: &str) -> bool {
    key.starts_with("adj:") || key.starts_with("prefix:")
}
