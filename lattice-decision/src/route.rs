//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use lattice_utils::mpls::{Label, LabelAction};
use lattice_utils::routing::{
    AdjacencyDatabase, ForwardingAlgorithm, ForwardingType, MetricEntity,
    MetricEntityOp, MetricVector, NextHop, PrefixEntry, PrefixType,
    RouteDatabase, RouteDatabaseDelta,
};
use tracing::warn;

use crate::graph::{NodeIndex, Topology};
use crate::spf::{
    is_loop_free_alternate, ksp2_ed_paths, run_spf, SpfResult,
};

// Advertisements for one prefix, keyed by advertising node.
pub type PrefixAdvertisements = Vec<(String, PrefixEntry)>;

// ===== global functions =====

/// Precedence rank of a prefix type; lower ranks win.
fn type_rank(prefix_type: PrefixType) -> u8 {
    match prefix_type {
        PrefixType::Loopback => 0,
        PrefixType::Client => 1,
        PrefixType::Bgp => 2,
        PrefixType::Default => 3,
    }
}

/// Compares two metric vectors: entities are visited in descending
/// priority order; the eligible side with the higher metric wins. Loner
/// entities resolve per their declared op.
pub fn compare_metric_vectors(
    a: &MetricVector,
    b: &MetricVector,
) -> Ordering {
    let entity =
        |vector: &'_ MetricVector, priority: i64| -> Option<MetricEntity> {
            vector
                .metrics
                .iter()
                .find(|entity| entity.priority == priority)
                .cloned()
        };

    let mut priorities = a
        .metrics
        .iter()
        .chain(b.metrics.iter())
        .map(|entity| entity.priority)
        .collect::<Vec<_>>();
    priorities.sort_unstable_by(|x, y| y.cmp(x));
    priorities.dedup();

    for priority in priorities {
        match (entity(a, priority), entity(b, priority)) {
            (Some(ea), Some(eb)) => {
                let ordering = ea.metric.cmp(&eb.metric);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(ea), None) => match ea.op {
                MetricEntityOp::WinIfPresent => return Ordering::Greater,
                MetricEntityOp::WinIfNotPresent => return Ordering::Less,
                MetricEntityOp::IgnoreIfNotPresent => (),
            },
            (None, Some(eb)) => match eb.op {
                MetricEntityOp::WinIfPresent => return Ordering::Less,
                MetricEntityOp::WinIfNotPresent => {
                    return Ordering::Greater;
                }
                MetricEntityOp::IgnoreIfNotPresent => (),
            },
            (None, None) => (),
        }
    }
    Ordering::Equal
}

/// Elects the winning advertisements for one prefix: best type first,
/// then the maximal set under metric-vector comparison.
pub fn select_best(
    advertisements: &PrefixAdvertisements,
) -> PrefixAdvertisements {
    let Some(best_rank) = advertisements
        .iter()
        .map(|(_, entry)| type_rank(entry.prefix_type))
        .min()
    else {
        return vec![];
    };
    let candidates = advertisements
        .iter()
        .filter(|(_, entry)| type_rank(entry.prefix_type) == best_rank)
        .cloned()
        .collect::<Vec<_>>();

    // Metric vectors only discriminate when every candidate carries
    // one.
    if candidates
        .iter()
        .any(|(_, entry)| entry.metric_vector.is_none())
    {
        return candidates;
    }

    // Keep the maximal set: nobody strictly above them.
    candidates
        .iter()
        .filter(|(_, entry)| {
            let vector = entry.metric_vector.as_ref().unwrap();
            !candidates.iter().any(|(_, other)| {
                compare_metric_vectors(
                    other.metric_vector.as_ref().unwrap(),
                    vector,
                ) == Ordering::Greater
            })
        })
        .cloned()
        .collect()
}

/// Computes the full route database from the topology and the
/// advertised prefixes, rooted at `root_name`.
pub fn compute_routes(
    root_name: &str,
    topology: &Topology,
    adj_dbs: &BTreeMap<String, AdjacencyDatabase>,
    prefixes: &BTreeMap<IpNetwork, PrefixAdvertisements>,
) -> RouteDatabase {
    let mut route_db = RouteDatabase::default();
    let Some(root) = topology.node_index(root_name) else {
        return route_db;
    };
    let spf = run_spf(topology, root, &BTreeSet::new());

    // Per-neighbor SPF distances, for the loop-free alternate check.
    let neighbor_spf = topology.nodes[root]
        .adjacencies
        .iter()
        .map(|&edge_index| {
            let neighbor = topology.edges[edge_index].v;
            (
                neighbor,
                run_spf(topology, neighbor, &BTreeSet::new()),
            )
        })
        .collect::<HashMap<_, _>>();

    // Unicast routes.
    for (prefix, advertisements) in prefixes {
        let winners = select_best(advertisements);
        if winners.is_empty()
            || winners.iter().any(|(node, _)| node == root_name)
        {
            // Prefixes we advertise ourselves are local.
            continue;
        }

        let next_hops = if winners.iter().all(|(_, entry)| {
            entry.forwarding_algorithm == ForwardingAlgorithm::Ksp2EdEcmp
        }) {
            ksp2_next_hops(topology, root, &spf, prefix, &winners)
        } else {
            let sr_mpls = winners.iter().all(|(_, entry)| {
                entry.forwarding_type == ForwardingType::SrMpls
            });
            ecmp_next_hops(topology, &spf, prefix, &winners, sr_mpls)
        };
        if next_hops.is_empty() {
            continue;
        }

        // Loop-free alternates on top of the primary set.
        let mut next_hops = next_hops;
        lfa_next_hops(
            topology,
            root,
            &spf,
            &neighbor_spf,
            prefix,
            &winners,
            &mut next_hops,
        );

        route_db.unicast_routes.insert(*prefix, next_hops);
    }

    // MPLS routes: remote node labels are swapped along the shortest
    // path, with penultimate-hop pop for direct neighbors.
    for (node_name, db) in adj_dbs {
        if node_name == root_name {
            continue;
        }
        let Some(node) = topology.node_index(node_name) else {
            continue;
        };
        let Some(first_hops) = spf.first_hops.get(&node) else {
            continue;
        };
        let label = match Label::new(db.node_label) {
            Ok(label) => label,
            Err(error) => {
                warn!(node = %node_name, %error, "invalid node label");
                continue;
            }
        };

        let next_hops = first_hops
            .iter()
            .filter_map(|&edge_index| {
                let edge = &topology.edges[edge_index];
                let address = edge.v6_addr.or(edge.v4_addr)?;
                let mpls_action = if edge.v == node {
                    LabelAction::PhpPop
                } else {
                    LabelAction::Swap(label)
                };
                Some(NextHop {
                    address,
                    if_name: edge.if_name.clone(),
                    metric: spf.distances[&node],
                    mpls_action: Some(mpls_action),
                    use_non_shortest_route: false,
                })
            })
            .collect::<Vec<_>>();
        if !next_hops.is_empty() {
            route_db.mpls_routes.insert(label, next_hops);
        }
    }

    // Our own adjacency labels get penultimate-hop pop straight out of
    // the corresponding interface.
    if let Some(own_db) = adj_dbs.get(root_name) {
        for &edge_index in &topology.nodes[root].adjacencies {
            let edge = &topology.edges[edge_index];
            let Ok(label) = Label::new(edge.adj_label) else {
                warn!(label = %edge.adj_label, "invalid adjacency label");
                continue;
            };
            let Some(address) = edge.v6_addr.or(edge.v4_addr) else {
                continue;
            };
            route_db.mpls_routes.insert(
                label,
                vec![NextHop {
                    address,
                    if_name: edge.if_name.clone(),
                    metric: edge.metric,
                    mpls_action: Some(LabelAction::PhpPop),
                    use_non_shortest_route: false,
                }],
            );
        }

        // Our own node label terminates here.
        if let Ok(label) = Label::new(own_db.node_label) {
            route_db.mpls_routes.insert(
                label,
                vec![NextHop {
                    address: IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                    if_name: "lo".to_owned(),
                    metric: 0,
                    mpls_action: Some(LabelAction::PopAndLookup),
                    use_non_shortest_route: false,
                }],
            );
        }
    }

    route_db
}

/// Delta between two consecutive route databases.
pub fn compute_delta(
    old: &RouteDatabase,
    new: &RouteDatabase,
) -> RouteDatabaseDelta {
    let mut delta = RouteDatabaseDelta::default();

    for (prefix, next_hops) in &new.unicast_routes {
        if old.unicast_routes.get(prefix) != Some(next_hops) {
            delta
                .unicast_routes_to_update
                .insert(*prefix, next_hops.clone());
        }
    }
    for prefix in old.unicast_routes.keys() {
        if !new.unicast_routes.contains_key(prefix) {
            delta.unicast_routes_to_delete.push(*prefix);
        }
    }

    for (label, next_hops) in &new.mpls_routes {
        if old.mpls_routes.get(label) != Some(next_hops) {
            delta.mpls_routes_to_update.insert(*label, next_hops.clone());
        }
    }
    for label in old.mpls_routes.keys() {
        if !new.mpls_routes.contains_key(label) {
            delta.mpls_routes_to_delete.push(*label);
        }
    }

    delta
}

// ===== helper functions =====

// Picks the next-hop address matching the prefix's address family.
fn edge_address(
    topology: &Topology,
    edge_index: usize,
    prefix: &IpNetwork,
) -> Option<IpAddr> {
    let edge = &topology.edges[edge_index];
    match prefix {
        IpNetwork::V4(_) => edge.v4_addr,
        IpNetwork::V6(_) => edge.v6_addr,
    }
}

// Union of equal-cost first hops toward every winning node.
fn ecmp_next_hops(
    topology: &Topology,
    spf: &SpfResult,
    prefix: &IpNetwork,
    winners: &PrefixAdvertisements,
    sr_mpls: bool,
) -> Vec<NextHop> {
    let mut next_hops = BTreeSet::new();
    for (node_name, _) in winners {
        let Some(node) = topology.node_index(node_name) else {
            continue;
        };
        let Some(first_hops) = spf.first_hops.get(&node) else {
            continue;
        };
        for &edge_index in first_hops {
            let Some(address) =
                edge_address(topology, edge_index, prefix)
            else {
                continue;
            };
            let edge = &topology.edges[edge_index];
            // Labeled forwarding pushes the destination node's label,
            // except when the destination is the direct neighbor.
            let mpls_action = if sr_mpls && edge.v != node {
                Label::new(topology.nodes[node].node_label)
                    .ok()
                    .map(|label| LabelAction::Push(vec![label]))
            } else {
                None
            };
            next_hops.insert(NextHop {
                address,
                if_name: edge.if_name.clone(),
                metric: spf.distances[&node],
                mpls_action,
                use_non_shortest_route: false,
            });
        }
    }
    next_hops.into_iter().collect()
}

// First hops of the two shortest edge-disjoint paths toward the
// closest winner.
fn ksp2_next_hops(
    topology: &Topology,
    root: NodeIndex,
    spf: &SpfResult,
    prefix: &IpNetwork,
    winners: &PrefixAdvertisements,
) -> Vec<NextHop> {
    // The algorithm runs toward the closest reachable winning node.
    let Some(dest) = winners
        .iter()
        .filter_map(|(node_name, _)| topology.node_index(node_name))
        .filter(|node| spf.distances.contains_key(node))
        .min_by_key(|node| spf.distances[node])
    else {
        return vec![];
    };

    let (first, second) = ksp2_ed_paths(topology, root, dest);
    let mut next_hops = vec![];
    for (path, use_non_shortest_route) in
        [(first, false), (second, true)]
    {
        let Some(path) = path else {
            continue;
        };
        let Some(&first_edge) = path.first() else {
            continue;
        };
        let Some(address) = edge_address(topology, first_edge, prefix)
        else {
            continue;
        };
        let metric = path
            .iter()
            .map(|&edge| topology.edges[edge].metric)
            .sum();
        next_hops.push(NextHop {
            address,
            if_name: topology.edges[first_edge].if_name.clone(),
            metric,
            mpls_action: None,
            use_non_shortest_route,
        });
    }
    next_hops
}

// Adds loop-free alternates: neighbors that can reach the destination
// without coming back through us.
#[allow(clippy::too_many_arguments)]
fn lfa_next_hops(
    topology: &Topology,
    root: NodeIndex,
    spf: &SpfResult,
    neighbor_spf: &HashMap<NodeIndex, SpfResult>,
    prefix: &IpNetwork,
    winners: &PrefixAdvertisements,
    next_hops: &mut Vec<NextHop>,
) {
    let primary_ifaces = next_hops
        .iter()
        .map(|next_hop| next_hop.if_name.clone())
        .collect::<BTreeSet<_>>();

    for &edge_index in &topology.nodes[root].adjacencies {
        let edge = &topology.edges[edge_index];
        if primary_ifaces.contains(&edge.if_name) {
            continue;
        }
        let Some(neighbor_result) = neighbor_spf.get(&edge.v) else {
            continue;
        };
        let Some(&dist_n_self) = neighbor_result.distances.get(&root)
        else {
            continue;
        };

        // The alternate must be loop-free toward every winning node.
        let loop_free = winners.iter().all(|(node_name, _)| {
            let Some(node) = topology.node_index(node_name) else {
                return false;
            };
            let (Some(&dist_n_dest), Some(&dist_self_dest)) = (
                neighbor_result.distances.get(&node),
                spf.distances.get(&node),
            ) else {
                return false;
            };
            is_loop_free_alternate(
                dist_n_dest,
                dist_n_self,
                dist_self_dest,
            )
        });
        if !loop_free {
            continue;
        }

        let Some(address) = edge_address(topology, edge_index, prefix)
        else {
            continue;
        };
        let metric = winners
            .iter()
            .filter_map(|(node_name, _)| {
                let node = topology.node_index(node_name)?;
                neighbor_result.distances.get(&node).copied()
            })
            .max()
            .unwrap_or(0)
            .saturating_add(edge.metric);
        next_hops.push(NextHop {
            address,
            if_name: edge.if_name.clone(),
            metric,
            mpls_action: None,
            use_non_shortest_route: true,
        });
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn entry(prefix_type: PrefixType) -> PrefixEntry {
        PrefixEntry {
            prefix: "10.0.0.0/8".parse().unwrap(),
            prefix_type,
            data: Bytes::new(),
            forwarding_type: ForwardingType::Ip,
            forwarding_algorithm: ForwardingAlgorithm::SpEcmp,
            ephemeral: false,
            metric_vector: None,
        }
    }

    fn vector(entries: Vec<(i64, i64, MetricEntityOp)>) -> MetricVector {
        MetricVector {
            metrics: entries
                .into_iter()
                .map(|(priority, metric, op)| MetricEntity {
                    priority,
                    metric,
                    op,
                })
                .collect(),
        }
    }

    #[test]
    fn type_precedence() {
        let advertisements = vec![
            ("n1".to_owned(), entry(PrefixType::Bgp)),
            ("n2".to_owned(), entry(PrefixType::Loopback)),
            ("n3".to_owned(), entry(PrefixType::Loopback)),
        ];
        let winners = select_best(&advertisements);
        assert_eq!(winners.len(), 2);
        assert!(winners.iter().all(|(_, entry)| entry.prefix_type
            == PrefixType::Loopback));
    }

    #[test]
    fn metric_vector_ordering() {
        // Higher metric at the highest priority wins.
        let a = vector(vec![(
            200,
            10,
            MetricEntityOp::WinIfPresent,
        )]);
        let b = vector(vec![(200, 5, MetricEntityOp::WinIfPresent)]);
        assert_eq!(compare_metric_vectors(&a, &b), Ordering::Greater);

        // Higher priority entity dominates lower ones.
        let a = vector(vec![
            (200, 1, MetricEntityOp::WinIfPresent),
            (100, 99, MetricEntityOp::WinIfPresent),
        ]);
        let b = vector(vec![
            (200, 2, MetricEntityOp::WinIfPresent),
            (100, 1, MetricEntityOp::WinIfPresent),
        ]);
        assert_eq!(compare_metric_vectors(&a, &b), Ordering::Less);

        // Loner rules.
        let with = vector(vec![(200, 1, MetricEntityOp::WinIfPresent)]);
        let without = vector(vec![]);
        assert_eq!(
            compare_metric_vectors(&with, &without),
            Ordering::Greater
        );
        let with =
            vector(vec![(200, 1, MetricEntityOp::WinIfNotPresent)]);
        assert_eq!(
            compare_metric_vectors(&with, &without),
            Ordering::Less
        );
        let with =
            vector(vec![(200, 1, MetricEntityOp::IgnoreIfNotPresent)]);
        assert_eq!(
            compare_metric_vectors(&with, &without),
            Ordering::Equal
        );
    }

    #[test]
    fn metric_vector_selects_maximal_set() {
        let mut best = entry(PrefixType::Bgp);
        best.metric_vector =
            Some(vector(vec![(200, 10, MetricEntityOp::WinIfPresent)]));
        let mut tied = entry(PrefixType::Bgp);
        tied.metric_vector =
            Some(vector(vec![(200, 10, MetricEntityOp::WinIfPresent)]));
        let mut worse = entry(PrefixType::Bgp);
        worse.metric_vector =
            Some(vector(vec![(200, 1, MetricEntityOp::WinIfPresent)]));

        let advertisements = vec![
            ("n1".to_owned(), best),
            ("n2".to_owned(), tied),
            ("n3".to_owned(), worse),
        ];
        let winners = select_best(&advertisements);
        assert_eq!(
            winners
                .iter()
                .map(|(node, _)| node.as_str())
                .collect::<Vec<_>>(),
            vec!["n1", "n2"]
        );
    }

    fn adjacency(
        other_node: &str,
        if_name: &str,
        other_if: &str,
        metric: u32,
    ) -> lattice_utils::routing::Adjacency {
        lattice_utils::routing::Adjacency {
            other_node_name: other_node.to_owned(),
            other_if_name: other_if.to_owned(),
            if_name: if_name.to_owned(),
            metric,
            adj_label: Label::new(1024).unwrap(),
            is_overloaded: false,
            rtt_us: None,
            timestamp: 0,
            weight: 1,
            v4_addr: None,
            v6_addr: Some("fe80::1".parse().unwrap()),
        }
    }

    fn chain_topology() -> (
        Topology,
        BTreeMap<String, AdjacencyDatabase>,
    ) {
        // a - b - c, metric 10 per hop.
        let mut dbs = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(index, name)| {
                (
                    name.to_string(),
                    AdjacencyDatabase {
                        this_node_name: name.to_string(),
                        is_overloaded: false,
                        node_label: 101 + index as u32,
                        adjacencies: vec![],
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        for (u, v) in [("a", "b"), ("b", "c")] {
            let if_uv = format!("if-{}-{}", u, v);
            let if_vu = format!("if-{}-{}", v, u);
            dbs.get_mut(u)
                .unwrap()
                .adjacencies
                .push(adjacency(v, &if_uv, &if_vu, 10));
            dbs.get_mut(v)
                .unwrap()
                .adjacencies
                .push(adjacency(u, &if_vu, &if_uv, 10));
        }
        let topology = Topology::build(&dbs);
        (topology, dbs)
    }

    #[test]
    fn computes_unicast_and_mpls_routes() {
        let (topology, dbs) = chain_topology();

        let prefix: IpNetwork = "2001:db8::/32".parse().unwrap();
        let mut entry = entry(PrefixType::Loopback);
        entry.prefix = prefix;
        let prefixes =
            BTreeMap::from([(prefix, vec![("c".to_owned(), entry)])]);

        let route_db = compute_routes("a", &topology, &dbs, &prefixes);

        // One unicast route toward c, two hops away.
        let next_hops = &route_db.unicast_routes[&prefix];
        assert_eq!(next_hops.len(), 1);
        assert_eq!(next_hops[0].if_name, "if-a-b");
        assert_eq!(next_hops[0].metric, 20);
        assert!(next_hops[0].mpls_action.is_none());

        // MPLS: our own label terminates, the direct neighbor's label
        // pops, the remote one swaps, and our adjacency label pops out
        // of the interface.
        let own = Label::new(101).unwrap();
        let b = Label::new(102).unwrap();
        let c = Label::new(103).unwrap();
        let adj = Label::new(1024).unwrap();
        assert_eq!(
            route_db.mpls_routes[&own][0].mpls_action,
            Some(LabelAction::PopAndLookup)
        );
        assert_eq!(
            route_db.mpls_routes[&b][0].mpls_action,
            Some(LabelAction::PhpPop)
        );
        assert_eq!(
            route_db.mpls_routes[&c][0].mpls_action,
            Some(LabelAction::Swap(c))
        );
        assert_eq!(
            route_db.mpls_routes[&adj][0].mpls_action,
            Some(LabelAction::PhpPop)
        );
    }

    #[test]
    fn own_prefixes_are_not_programmed() {
        let (topology, dbs) = chain_topology();

        let prefix: IpNetwork = "2001:db8::/32".parse().unwrap();
        let mut advertised = entry(PrefixType::Loopback);
        advertised.prefix = prefix;
        let prefixes = BTreeMap::from([(
            prefix,
            vec![("a".to_owned(), advertised)],
        )]);

        let route_db = compute_routes("a", &topology, &dbs, &prefixes);
        assert!(route_db.unicast_routes.is_empty());
    }

    #[test]
    fn delta_tracks_changes() {
        let prefix: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let gone: IpNetwork = "11.0.0.0/8".parse().unwrap();
        let next_hop = NextHop {
            address: "fe80::1".parse().unwrap(),
            if_name: "eth0".to_owned(),
            metric: 10,
            mpls_action: None,
            use_non_shortest_route: false,
        };

        let mut old = RouteDatabase::default();
        old.unicast_routes.insert(gone, vec![next_hop.clone()]);
        let mut new = RouteDatabase::default();
        new.unicast_routes.insert(prefix, vec![next_hop]);

        let delta = compute_delta(&old, &new);
        assert_eq!(
            delta.unicast_routes_to_update.keys().collect::<Vec<_>>(),
            vec![&prefix]
        );
        assert_eq!(delta.unicast_routes_to_delete, vec![gone]);

        // Unchanged databases produce an empty delta.
        let delta = compute_delta(&new, &new);
        assert!(delta.is_empty());
    }
}
