//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use lattice_utils::routing::AdjacencyDatabase;

pub type NodeIndex = usize;
pub type EdgeIndex = usize;

/// One node of the topology graph.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub overloaded: bool,
    pub node_label: u32,
    // Outgoing edges.
    pub adjacencies: Vec<EdgeIndex>,
}

/// One directed edge of the topology graph. Both directions of a
/// symmetric adjacency get their own edge.
#[derive(Debug)]
pub struct Edge {
    pub u: NodeIndex,
    pub v: NodeIndex,
    // max() of the two directions' advertised metrics.
    pub metric: u32,
    // Interface of `u` the edge leaves through.
    pub if_name: String,
    // Addresses of `v` on this link, for next-hop construction.
    pub v4_addr: Option<IpAddr>,
    pub v6_addr: Option<IpAddr>,
    // Label `u` assigned to this adjacency.
    pub adj_label: u32,
}

/// Arena-indexed topology built from the advertised adjacency
/// databases. Lookups go through integer indices; there are no
/// back-pointers.
#[derive(Debug, Default)]
pub struct Topology {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    name_index: HashMap<String, NodeIndex>,
}

// ===== impl Topology =====

impl Topology {
    /// Builds the graph from the adjacency databases, keeping only
    /// symmetric adjacencies: `u -> v` exists iff `u` advertises `v`
    /// and `v` advertises `u` over the same interface pair.
    pub fn build(
        adj_dbs: &BTreeMap<String, AdjacencyDatabase>,
    ) -> Topology {
        let mut topology = Topology::default();

        for (name, db) in adj_dbs {
            topology.add_node(
                name.clone(),
                db.is_overloaded,
                db.node_label,
            );
        }

        for (u_name, u_db) in adj_dbs {
            let u = topology.name_index[u_name];
            for u_adj in &u_db.adjacencies {
                let Some(v_db) = adj_dbs.get(&u_adj.other_node_name)
                else {
                    continue;
                };
                // The reverse direction must be advertised over the
                // same interface pair.
                let Some(v_adj) =
                    v_db.adjacencies.iter().find(|v_adj| {
                        v_adj.other_node_name == *u_name
                            && v_adj.if_name == u_adj.other_if_name
                            && v_adj.other_if_name == u_adj.if_name
                    })
                else {
                    continue;
                };
                // An overloaded interface drains the whole link.
                if u_adj.is_overloaded || v_adj.is_overloaded {
                    continue;
                }

                let v = topology.name_index[&u_adj.other_node_name];
                let edge = Edge {
                    u,
                    v,
                    metric: u_adj.metric.max(v_adj.metric),
                    if_name: u_adj.if_name.clone(),
                    v4_addr: u_adj.v4_addr,
                    v6_addr: u_adj.v6_addr,
                    adj_label: u_adj.adj_label.get(),
                };
                let edge_index = topology.edges.len();
                topology.edges.push(edge);
                topology.nodes[u].adjacencies.push(edge_index);
            }
        }

        topology
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.name_index.get(name).copied()
    }

    fn add_node(
        &mut self,
        name: String,
        overloaded: bool,
        node_label: u32,
    ) -> NodeIndex {
        let index = self.nodes.len();
        self.name_index.insert(name.clone(), index);
        self.nodes.push(Node {
            name,
            overloaded,
            node_label,
            adjacencies: vec![],
        });
        index
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use lattice_utils::mpls::Label;
    use lattice_utils::routing::Adjacency;

    use super::*;

    pub(crate) fn adjacency(
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

    fn adj_db(
        node: &str,
        adjacencies: Vec<Adjacency>,
    ) -> AdjacencyDatabase {
        AdjacencyDatabase {
            this_node_name: node.to_owned(),
            is_overloaded: false,
            node_label: 100,
            adjacencies,
        }
    }

    #[test]
    fn symmetric_adjacencies_only() {
        // a <-> b is bidirectional; a -> c is only advertised by a.
        let dbs = BTreeMap::from([
            (
                "a".to_owned(),
                adj_db(
                    "a",
                    vec![
                        adjacency("b", "if-ab", "if-ba", 10),
                        adjacency("c", "if-ac", "if-ca", 10),
                    ],
                ),
            ),
            (
                "b".to_owned(),
                adj_db("b", vec![adjacency("a", "if-ba", "if-ab", 20)]),
            ),
            ("c".to_owned(), adj_db("c", vec![])),
        ]);

        let topology = Topology::build(&dbs);
        assert_eq!(topology.nodes.len(), 3);
        // Only a->b and b->a survive.
        assert_eq!(topology.edges.len(), 2);

        // Metric is the max of the two directions.
        assert!(topology.edges.iter().all(|edge| edge.metric == 20));

        let a = topology.node_index("a").unwrap();
        let c = topology.node_index("c").unwrap();
        assert_eq!(topology.nodes[a].adjacencies.len(), 1);
        assert!(topology.nodes[c].adjacencies.is_empty());
    }

    #[test]
    fn overloaded_interface_drains_the_link() {
        let mut a_adj = adjacency("b", "if-ab", "if-ba", 10);
        a_adj.is_overloaded = true;
        let dbs = BTreeMap::from([
            ("a".to_owned(), adj_db("a", vec![a_adj])),
            (
                "b".to_owned(),
                adj_db("b", vec![adjacency("a", "if-ba", "if-ab", 10)]),
            ),
        ]);

        let topology = Topology::build(&dbs);
        assert!(topology.edges.is_empty());
    }
}
