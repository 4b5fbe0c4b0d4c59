//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::SptInfo;

pub const DISTANCE_INFINITY: u64 = u64::MAX;

// Messages of the spanning-tree computation, exchanged between directly
// connected stores. Every message names the root whose tree it refers
// to.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DualMessage {
    // Peer announcement, answered with Updates for all known roots.
    Hello { from: String },
    // Distance advertisement.
    Update { root: String, from: String, distance: u64 },
    // Diffusing computation request.
    Query { root: String, from: String, distance: u64 },
    // Diffusing computation answer.
    Reply { root: String, from: String, distance: u64 },
}

// Actions produced by one processing step, executed by the store task.
#[derive(Debug, Default)]
pub struct DualActions {
    // Messages to send, per peer.
    pub messages: Vec<(String, DualMessage)>,
    // Parent (de)registrations to signal: (peer, root, set).
    pub parent_updates: Vec<(String, String, bool)>,
}

// Per-root DUAL state.
#[derive(Debug)]
struct DualRoot {
    root: String,
    // Distances reported by each peer.
    reported: BTreeMap<String, u64>,
    // Our current distance to the root.
    distance: u64,
    // Feasible distance: the lowest distance this node ever reported
    // while passive. Only peers strictly below it may become successor.
    fd: u64,
    successor: Option<String>,
    // True while a diffusing computation is in progress.
    active: bool,
    pending_replies: BTreeSet<String>,
    // Peers that chose us as their parent.
    children: BTreeSet<String>,
}

/// Loop-free spanning-tree flood topology over the peers of one area.
///
/// A Dual-family distance-vector computes a parent and child set per
/// configured root. The feasibility condition (a successor's reported
/// distance must be strictly below our feasible distance) preserves loop
/// freedom; when it cannot be met, a diffusing computation
/// (Query/Reply) re-establishes a safe feasible distance.
#[derive(Debug)]
pub struct FloodTopology {
    node_name: String,
    is_root: bool,
    peers: BTreeSet<String>,
    roots: BTreeMap<String, DualRoot>,
}

// ===== impl DualRoot =====

impl DualRoot {
    fn new(root: String) -> DualRoot {
        DualRoot {
            root,
            reported: BTreeMap::new(),
            distance: DISTANCE_INFINITY,
            fd: DISTANCE_INFINITY,
            successor: None,
            active: false,
            pending_replies: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    fn new_self_root(root: String) -> DualRoot {
        DualRoot {
            distance: 0,
            fd: 0,
            ..DualRoot::new(root)
        }
    }

    // Picks the best feasible successor: lowest reported distance, name
    // as tie-break.
    fn best_feasible(&self) -> Option<(&String, u64)> {
        self.reported
            .iter()
            .filter(|(_, distance)| **distance < self.fd)
            .min_by_key(|(peer, distance)| (**distance, (*peer).clone()))
            .map(|(peer, distance)| (peer, *distance))
    }

    // Unconstrained best candidate, used when the feasible distance is
    // reset at the end of a diffusing computation.
    fn best_any(&self) -> Option<(&String, u64)> {
        self.reported
            .iter()
            .min_by_key(|(peer, distance)| (**distance, (*peer).clone()))
            .map(|(peer, distance)| (peer, *distance))
    }
}

// ===== impl FloodTopology =====

impl FloodTopology {
    pub fn new(node_name: String, is_root: bool) -> FloodTopology {
        let mut roots = BTreeMap::new();
        if is_root {
            roots.insert(
                node_name.clone(),
                DualRoot::new_self_root(node_name.clone()),
            );
        }
        FloodTopology {
            node_name,
            is_root,
            peers: BTreeSet::new(),
            roots,
        }
    }

    /// Registers a new peer link and greets it.
    pub fn peer_up(&mut self, peer: String) -> DualActions {
        let mut actions = DualActions::default();
        if !self.peers.insert(peer.clone()) {
            return actions;
        }

        actions.messages.push((
            peer.clone(),
            DualMessage::Hello {
                from: self.node_name.clone(),
            },
        ));
        for state in self.roots.values() {
            actions.messages.push((
                peer.clone(),
                DualMessage::Update {
                    root: state.root.clone(),
                    from: self.node_name.clone(),
                    distance: state.distance,
                },
            ));
        }
        actions
    }

    /// Removes a peer link, recomputing every tree it participated in.
    pub fn peer_down(&mut self, peer: &str) -> DualActions {
        let mut actions = DualActions::default();
        if !self.peers.remove(peer) {
            return actions;
        }

        let roots = self.roots.keys().cloned().collect::<Vec<_>>();
        for root in roots {
            let state = self.roots.get_mut(&root).unwrap();
            state.reported.remove(peer);
            state.children.remove(peer);
            state.pending_replies.remove(peer);
            if state.successor.as_deref() == Some(peer) {
                self.recompute(&root, &mut actions);
            } else if state.active && state.pending_replies.is_empty() {
                self.finish_diffusing(&root, &mut actions);
            }
        }
        actions
    }

    /// Processes one inbound Dual message.
    pub fn process_message(&mut self, msg: DualMessage) -> DualActions {
        let mut actions = DualActions::default();
        match msg {
            DualMessage::Hello { from } => {
                for state in self.roots.values() {
                    actions.messages.push((
                        from.clone(),
                        DualMessage::Update {
                            root: state.root.clone(),
                            from: self.node_name.clone(),
                            distance: state.distance,
                        },
                    ));
                }
            }
            DualMessage::Update {
                root,
                from,
                distance,
            } => {
                let state = self.root_entry(&root);
                state.reported.insert(from, distance);
                if !state.active {
                    self.recompute(&root, &mut actions);
                }
            }
            DualMessage::Query {
                root,
                from,
                distance,
            } => {
                let state = self.root_entry(&root);
                state.reported.insert(from.clone(), distance);
                let our_distance = state.distance;
                actions.messages.push((
                    from,
                    DualMessage::Reply {
                        root: root.clone(),
                        from: self.node_name.clone(),
                        distance: our_distance,
                    },
                ));
                let state = &self.roots[&root];
                if !state.active {
                    self.recompute(&root, &mut actions);
                }
            }
            DualMessage::Reply {
                root,
                from,
                distance,
            } => {
                let state = self.root_entry(&root);
                state.reported.insert(from.clone(), distance);
                state.pending_replies.remove(&from);
                if state.active && state.pending_replies.is_empty() {
                    self.finish_diffusing(&root, &mut actions);
                }
            }
        }
        actions
    }

    /// Registers or unregisters a peer as our child for the given root.
    pub fn set_child(&mut self, root: &str, child: String, set: bool) {
        let state = self.root_entry(root);
        if set {
            state.children.insert(child);
        } else {
            state.children.remove(&child);
        }
    }

    /// Peers the given publication should be flooded to: the parent and
    /// children of the elected root's tree, or every peer when no tree
    /// has formed yet.
    pub fn flood_peers(&self) -> BTreeSet<String> {
        match self.elected_root() {
            Some(state) => {
                let mut peers = state.children.clone();
                if let Some(successor) = &state.successor {
                    peers.insert(successor.clone());
                }
                peers
            }
            None => self.peers.clone(),
        }
    }

    pub fn spt_infos(&self) -> Vec<SptInfo> {
        self.roots
            .values()
            .map(|state| SptInfo {
                root: state.root.clone(),
                passive: !state.active,
                cost: state.distance,
                parent: state.successor.clone(),
                children: state.children.clone(),
            })
            .collect()
    }

    // The elected root is the lowest-named root this node has a path to.
    fn elected_root(&self) -> Option<&DualRoot> {
        self.roots.values().find(|state| {
            state.successor.is_some() || state.root == self.node_name
        })
    }

    fn root_entry(&mut self, root: &str) -> &mut DualRoot {
        if root == self.node_name && self.is_root {
            return self.roots.get_mut(root).unwrap();
        }
        self.roots
            .entry(root.to_owned())
            .or_insert_with(|| DualRoot::new(root.to_owned()))
    }

    // Passive-state route selection under the feasibility condition.
    fn recompute(&mut self, root: &str, actions: &mut DualActions) {
        if root == self.node_name {
            return;
        }
        let peers = self.peers.clone();
        let node_name = self.node_name.clone();
        let state = self.roots.get_mut(root).unwrap();

        match state.best_feasible() {
            Some((peer, reported)) => {
                let peer = peer.clone();
                let new_distance = reported.saturating_add(1);
                let old_successor = state.successor.clone();
                let old_distance = state.distance;

                state.successor = Some(peer.clone());
                state.distance = new_distance;
                state.fd = state.fd.min(new_distance);

                if old_successor.as_ref() != Some(&peer) {
                    debug!(%root, parent = %peer, "flood tree parent change");
                    if let Some(old) = old_successor {
                        actions.parent_updates.push((
                            old,
                            root.to_owned(),
                            false,
                        ));
                    }
                    actions.parent_updates.push((
                        peer,
                        root.to_owned(),
                        true,
                    ));
                }
                if old_distance != new_distance {
                    for peer in &peers {
                        actions.messages.push((
                            peer.clone(),
                            DualMessage::Update {
                                root: root.to_owned(),
                                from: node_name.clone(),
                                distance: new_distance,
                            },
                        ));
                    }
                }
            }
            None => {
                // No feasible successor: start a diffusing computation.
                if peers.is_empty() {
                    let old_successor = state.successor.take();
                    state.distance = DISTANCE_INFINITY;
                    state.fd = DISTANCE_INFINITY;
                    if let Some(old) = old_successor {
                        actions.parent_updates.push((
                            old,
                            root.to_owned(),
                            false,
                        ));
                    }
                    return;
                }
                state.active = true;
                state.distance = DISTANCE_INFINITY;
                state.pending_replies = peers.clone();
                for peer in &peers {
                    actions.messages.push((
                        peer.clone(),
                        DualMessage::Query {
                            root: root.to_owned(),
                            from: node_name.clone(),
                            distance: DISTANCE_INFINITY,
                        },
                    ));
                }
            }
        }
    }

    // All replies are in: the feasible distance may be reset and the
    // best candidate selected unconditionally.
    fn finish_diffusing(&mut self, root: &str, actions: &mut DualActions) {
        let peers = self.peers.clone();
        let node_name = self.node_name.clone();
        let state = self.roots.get_mut(root).unwrap();
        state.active = false;

        let old_successor = state.successor.clone();
        match state.best_any() {
            Some((peer, reported)) if reported != DISTANCE_INFINITY => {
                let peer = peer.clone();
                let new_distance = reported.saturating_add(1);
                state.successor = Some(peer.clone());
                state.distance = new_distance;
                state.fd = new_distance;

                if old_successor.as_ref() != Some(&peer) {
                    if let Some(old) = old_successor {
                        actions.parent_updates.push((
                            old,
                            root.to_owned(),
                            false,
                        ));
                    }
                    actions.parent_updates.push((
                        peer,
                        root.to_owned(),
                        true,
                    ));
                }
                for peer in &peers {
                    actions.messages.push((
                        peer.clone(),
                        DualMessage::Update {
                            root: root.to_owned(),
                            from: node_name.clone(),
                            distance: new_distance,
                        },
                    ));
                }
            }
            _ => {
                state.successor = None;
                state.distance = DISTANCE_INFINITY;
                state.fd = DISTANCE_INFINITY;
                if let Some(old) = old_successor {
                    actions.parent_updates.push((
                        old,
                        root.to_owned(),
                        false,
                    ));
                }
            }
        }
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn update(root: &str, from: &str, distance: u64) -> DualMessage {
        DualMessage::Update {
            root: root.to_owned(),
            from: from.to_owned(),
            distance,
        }
    }

    #[test]
    fn chain_converges() {
        // r --- a --- b, with r as the flood root.
        let mut a = FloodTopology::new("a".to_owned(), false);
        a.peer_up("r".to_owned());
        a.peer_up("b".to_owned());

        let actions = a.process_message(update("r", "r", 0));
        assert_eq!(
            a.spt_infos(),
            vec![SptInfo {
                root: "r".to_owned(),
                passive: true,
                cost: 1,
                parent: Some("r".to_owned()),
                children: BTreeSet::new(),
            }]
        );
        // The new distance is advertised to both peers and the parent is
        // notified.
        assert_eq!(actions.messages.len(), 2);
        assert_eq!(
            actions.parent_updates,
            vec![("r".to_owned(), "r".to_owned(), true)]
        );

        // b selects a as parent and registers as a's child.
        a.set_child("r", "b".to_owned(), true);
        assert_eq!(
            a.flood_peers(),
            BTreeSet::from(["r".to_owned(), "b".to_owned()])
        );
    }

    #[test]
    fn feasibility_rejects_longer_paths() {
        let mut a = FloodTopology::new("a".to_owned(), false);
        a.peer_up("r".to_owned());
        a.peer_up("c".to_owned());

        a.process_message(update("r", "r", 0));
        assert_eq!(a.spt_infos()[0].cost, 1);

        // c reports a distance above our feasible distance; it must not
        // displace the current parent.
        a.process_message(update("r", "c", 5));
        let info = &a.spt_infos()[0];
        assert_eq!(info.parent, Some("r".to_owned()));
        assert_eq!(info.cost, 1);
    }

    #[test]
    fn successor_loss_triggers_diffusing_computation() {
        let mut a = FloodTopology::new("a".to_owned(), false);
        a.peer_up("r".to_owned());
        a.peer_up("c".to_owned());

        a.process_message(update("r", "r", 0));
        // c is at distance 2 (via us or elsewhere): not feasible while
        // fd == 1.
        a.process_message(update("r", "c", 2));

        // Losing the parent link forces a Query round.
        let actions = a.peer_down("r");
        assert!(actions
            .messages
            .iter()
            .all(|(_, msg)| matches!(msg, DualMessage::Query { .. })));
        assert!(!a.spt_infos()[0].passive);

        // c replies with a finite distance; the tree reforms through it.
        let actions = a.process_message(DualMessage::Reply {
            root: "r".to_owned(),
            from: "c".to_owned(),
            distance: 2,
        });
        let info = &a.spt_infos()[0];
        assert!(info.passive);
        assert_eq!(info.parent, Some("c".to_owned()));
        assert_eq!(info.cost, 3);
        assert!(actions
            .parent_updates
            .contains(&("c".to_owned(), "r".to_owned(), true)));
    }

    #[test]
    fn root_reports_zero_cost() {
        let r = FloodTopology::new("r".to_owned(), true);
        let infos = r.spt_infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].cost, 0);
        assert_eq!(infos[0].parent, None);
    }
}
