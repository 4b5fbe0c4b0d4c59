//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::graph::{EdgeIndex, NodeIndex, Topology};

/// Result of one Dijkstra run.
#[derive(Debug, Default)]
pub struct SpfResult {
    // Shortest distance per reachable node.
    pub distances: HashMap<NodeIndex, u32>,
    // Equal-cost first-hop edges (out of the root) per reachable node.
    pub first_hops: HashMap<NodeIndex, BTreeSet<EdgeIndex>>,
}

// ===== global functions =====

/// Dijkstra with equal-cost multipath tracking.
///
/// Overloaded nodes are transit-forbidden: their edges are never
/// relaxed, but the nodes themselves remain valid endpoints.
pub fn run_spf(
    topology: &Topology,
    root: NodeIndex,
    excluded_edges: &BTreeSet<EdgeIndex>,
) -> SpfResult {
    let mut result = SpfResult::default();
    let mut heap = BinaryHeap::new();

    result.distances.insert(root, 0);
    result.first_hops.insert(root, BTreeSet::new());
    heap.push(Reverse((0u32, root)));

    while let Some(Reverse((distance, u))) = heap.pop() {
        if distance > result.distances[&u] {
            continue;
        }
        // Transit through an overloaded node is forbidden.
        if u != root && topology.nodes[u].overloaded {
            continue;
        }

        for &edge_index in &topology.nodes[u].adjacencies {
            if excluded_edges.contains(&edge_index) {
                continue;
            }
            let edge = &topology.edges[edge_index];
            let v = edge.v;
            let candidate = distance.saturating_add(edge.metric);

            // First hops out of the root seed the ECMP sets; deeper
            // relaxations propagate them.
            let hops_via_u = if u == root {
                BTreeSet::from([edge_index])
            } else {
                result.first_hops[&u].clone()
            };

            match result.distances.get(&v) {
                Some(&best) if candidate > best => (),
                Some(&best) if candidate == best => {
                    result
                        .first_hops
                        .get_mut(&v)
                        .unwrap()
                        .extend(hops_via_u);
                }
                _ => {
                    result.distances.insert(v, candidate);
                    result.first_hops.insert(v, hops_via_u);
                    heap.push(Reverse((candidate, v)));
                }
            }
        }
    }

    result
}

/// Shortest path to `dest` as a list of edges, following one arbitrary
/// branch of the ECMP fan.
pub fn shortest_path_edges(
    topology: &Topology,
    root: NodeIndex,
    dest: NodeIndex,
    excluded_edges: &BTreeSet<EdgeIndex>,
) -> Option<Vec<EdgeIndex>> {
    let spf = run_spf(topology, root, excluded_edges);
    spf.distances.get(&dest)?;

    // Walk backwards from dest: at each node pick an incoming edge on a
    // shortest path.
    let mut path = vec![];
    let mut current = dest;
    while current != root {
        let edge_index = topology
            .edges
            .iter()
            .enumerate()
            .filter(|(index, _)| !excluded_edges.contains(index))
            .find(|(_, edge)| {
                edge.v == current
                    && spf.distances.get(&edge.u).is_some_and(|&du| {
                        du.saturating_add(edge.metric)
                            == spf.distances[&current]
                    })
            })
            .map(|(index, _)| index)?;
        path.push(edge_index);
        current = topology.edges[edge_index].u;
    }
    path.reverse();
    Some(path)
}

/// The two shortest edge-disjoint paths to `dest`: the shortest path,
/// plus the shortest path of the graph with the first path's edges (in
/// both directions) removed.
pub fn ksp2_ed_paths(
    topology: &Topology,
    root: NodeIndex,
    dest: NodeIndex,
) -> (Option<Vec<EdgeIndex>>, Option<Vec<EdgeIndex>>) {
    let excluded = BTreeSet::new();
    let Some(first) = shortest_path_edges(topology, root, dest, &excluded)
    else {
        return (None, None);
    };

    // Exclude both directions of every edge on the first path.
    let mut excluded = BTreeSet::new();
    for &edge_index in &first {
        excluded.insert(edge_index);
        let edge = &topology.edges[edge_index];
        for (reverse_index, reverse) in topology.edges.iter().enumerate()
        {
            if reverse.u == edge.v && reverse.v == edge.u {
                excluded.insert(reverse_index);
            }
        }
    }

    let second = shortest_path_edges(topology, root, dest, &excluded);
    (Some(first), second)
}

/// Loop-free alternate criterion: neighbor `n` is a safe alternate
/// toward `dest` iff `dist(n, dest) < dist(n, self) + dist(self, dest)`.
pub fn is_loop_free_alternate(
    dist_n_dest: u32,
    dist_n_self: u32,
    dist_self_dest: u32,
) -> bool {
    dist_n_dest < dist_n_self.saturating_add(dist_self_dest)
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lattice_utils::mpls::Label;
    use lattice_utils::routing::{Adjacency, AdjacencyDatabase};

    use super::*;

    fn adjacency(
        other_node: &str,
        if_name: &str,
        other_if: &str,
        metric: u32,
    ) -> Adjacency {
        Adjacency {
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

    fn symmetric_link(
        dbs: &mut BTreeMap<String, AdjacencyDatabase>,
        a: &str,
        b: &str,
        metric: u32,
    ) {
        let if_ab = format!("if-{}-{}", a, b);
        let if_ba = format!("if-{}-{}", b, a);
        dbs.get_mut(a)
            .unwrap()
            .adjacencies
            .push(adjacency(b, &if_ab, &if_ba, metric));
        dbs.get_mut(b)
            .unwrap()
            .adjacencies
            .push(adjacency(a, &if_ba, &if_ab, metric));
    }

    fn nodes(names: &[&str]) -> BTreeMap<String, AdjacencyDatabase> {
        names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    AdjacencyDatabase {
                        this_node_name: name.to_string(),
                        is_overloaded: false,
                        node_label: 100,
                        adjacencies: vec![],
                    },
                )
            })
            .collect()
    }

    #[test]
    fn ecmp_tracks_all_first_hops() {
        // Square: a-b-d and a-c-d with equal metrics.
        let mut dbs = nodes(&["a", "b", "c", "d"]);
        symmetric_link(&mut dbs, "a", "b", 10);
        symmetric_link(&mut dbs, "a", "c", 10);
        symmetric_link(&mut dbs, "b", "d", 10);
        symmetric_link(&mut dbs, "c", "d", 10);

        let topology = Topology::build(&dbs);
        let a = topology.node_index("a").unwrap();
        let d = topology.node_index("d").unwrap();

        let spf = run_spf(&topology, a, &BTreeSet::new());
        assert_eq!(spf.distances[&d], 20);
        assert_eq!(spf.first_hops[&d].len(), 2);
    }

    #[test]
    fn overloaded_node_is_transit_forbidden() {
        // a-b-d (cheap, through b) vs a-c-d (expensive), b overloaded.
        let mut dbs = nodes(&["a", "b", "c", "d"]);
        symmetric_link(&mut dbs, "a", "b", 1);
        symmetric_link(&mut dbs, "b", "d", 1);
        symmetric_link(&mut dbs, "a", "c", 10);
        symmetric_link(&mut dbs, "c", "d", 10);
        dbs.get_mut("b").unwrap().is_overloaded = true;

        let topology = Topology::build(&dbs);
        let a = topology.node_index("a").unwrap();
        let b = topology.node_index("b").unwrap();
        let d = topology.node_index("d").unwrap();

        let spf = run_spf(&topology, a, &BTreeSet::new());
        // b is still a valid endpoint.
        assert_eq!(spf.distances[&b], 1);
        // But traffic to d detours around it.
        assert_eq!(spf.distances[&d], 20);
    }

    #[test]
    fn ksp2_paths_are_edge_disjoint() {
        // Square with unequal sides, so the two paths differ.
        let mut dbs = nodes(&["a", "b", "c", "d"]);
        symmetric_link(&mut dbs, "a", "b", 1);
        symmetric_link(&mut dbs, "b", "d", 1);
        symmetric_link(&mut dbs, "a", "c", 5);
        symmetric_link(&mut dbs, "c", "d", 5);

        let topology = Topology::build(&dbs);
        let a = topology.node_index("a").unwrap();
        let d = topology.node_index("d").unwrap();

        let (first, second) = ksp2_ed_paths(&topology, a, d);
        let first = first.unwrap();
        let second = second.unwrap();

        // Shortest goes through b, alternate through c.
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        let first_edges = first.iter().collect::<BTreeSet<_>>();
        assert!(second.iter().all(|edge| !first_edges.contains(edge)));
    }

    #[test]
    fn lfa_criterion() {
        // n is loop-free if its path to dest avoids us.
        assert!(is_loop_free_alternate(10, 5, 10));
        // n routes through us: 5 + 10 <= 15, not loop-free.
        assert!(!is_loop_free_alternate(15, 5, 10));
    }
}
