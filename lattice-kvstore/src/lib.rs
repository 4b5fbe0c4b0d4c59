//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod dual;
pub mod error;
pub mod flood;
pub mod net;
pub mod store;
pub mod types;

pub use error::Error;
pub use net::Message;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use lattice_utils::task::Task;
use lattice_utils::Area;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, Instrument};

use crate::dual::{DualActions, DualMessage, FloodTopology};
use crate::error::IoError;
use crate::flood::{FloodBuffer, TokenBucket};
use crate::net::NetEvent;
use crate::store::KeyValueMap;
use crate::types::{
    KeyDumpParams, KeySetParams, KvFilters, KvStoreCounters, PeerInfo,
    PeerSpec, Publication, SptInfo, Value, ValueDigest,
};

// Capacity of one subscriber's publication queue.
const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

// How a batch of records relates to this store's own origination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SelfOrigin {
    // Locally set and kept alive with TTL refreshes.
    Refresh,
    // Locally set but left to expire (tombstones).
    Expire,
    // Received from the network.
    Remote,
}

/// KvStore configuration.
#[derive(Clone, Debug)]
pub struct KvStoreConfig {
    pub node_name: String,
    pub listen_addr: SocketAddr,
    pub areas: Vec<Area>,
    // Outbound flood rate limit.
    pub flood_rate: FloodRate,
    // Spanning-tree flood optimization instead of plain flooding.
    pub enable_flood_optimization: bool,
    pub is_flood_root: bool,
    // Leaf-mode filters; `None` accepts everything.
    pub filters: Option<KvFilters>,
}

#[derive(Clone, Copy, Debug)]
pub struct FloodRate {
    pub msgs_per_sec: u32,
    pub burst_size: u32,
}

impl Default for FloodRate {
    fn default() -> FloodRate {
        FloodRate {
            msgs_per_sec: 1024,
            burst_size: 256,
        }
    }
}

// Requests accepted by the store task.
#[derive(Debug)]
enum Command {
    SetKeys {
        area: Area,
        params: KeySetParams,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    GetKeys {
        area: Area,
        keys: Vec<String>,
        responder: oneshot::Sender<Result<BTreeMap<String, Value>, Error>>,
    },
    DumpKeys {
        area: Area,
        params: KeyDumpParams,
        responder: oneshot::Sender<Result<BTreeMap<String, Value>, Error>>,
    },
    DumpHashes {
        area: Area,
        params: KeyDumpParams,
        responder: oneshot::Sender<Result<BTreeMap<String, Value>, Error>>,
    },
    AddPeers {
        area: Area,
        peers: BTreeMap<String, PeerSpec>,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    DelPeers {
        area: Area,
        peers: Vec<String>,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    GetPeers {
        area: Area,
        responder: oneshot::Sender<Result<BTreeMap<String, PeerInfo>, Error>>,
    },
    Subscribe {
        include_snapshot: bool,
        responder: oneshot::Sender<(
            Option<Publication>,
            Receiver<Publication>,
        )>,
    },
    SubscriberCount {
        responder: oneshot::Sender<usize>,
    },
    ProcessDualMessage {
        area: Area,
        message: DualMessage,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    UpdateFloodTopologyChild {
        area: Area,
        root: String,
        child: String,
        set: bool,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    GetSpanningTreeInfos {
        area: Area,
        responder: oneshot::Sender<Result<Vec<SptInfo>, Error>>,
    },
    GetCounters {
        responder: oneshot::Sender<KvStoreCounters>,
    },
}

/// Client handle to a running KvStore task.
#[derive(Clone, Debug)]
pub struct KvStoreHandle {
    cmd_tx: Sender<Command>,
}

// Per-area replication state.
struct AreaState {
    key_vals: KeyValueMap,
    // Configured peers, keyed by node name.
    peers: BTreeMap<String, Peer>,
    // Live connections able to carry outbound messages, keyed by node
    // name. Includes inbound subscribers and our own peer connections.
    sinks: BTreeMap<String, Sender<Message>>,
    // Spanning-tree state when flood optimization is enabled.
    topology: Option<FloodTopology>,
    flood_buffer: FloodBuffer,
}

struct Peer {
    spec: PeerSpec,
    initial_sync_done: bool,
    _task: Task<()>,
}

/// Eventually-consistent replicated key-value store.
///
/// Runs as a single task owning all state; peers, subscribers and
/// control requests all communicate through channels.
pub struct KvStore {
    config: KvStoreConfig,
    areas: BTreeMap<Area, AreaState>,
    subscribers: Vec<Sender<Publication>>,
    token_bucket: TokenBucket,
    cmd_rx: Receiver<Command>,
    net_rx: Receiver<NetEvent>,
    net_tx: Sender<NetEvent>,
    _listener: Task<()>,
}

// ===== impl KvStore =====

impl KvStore {
    /// Binds the peer listener and spawns the store task. Returns the
    /// handle, the bound address and the task.
    pub async fn spawn(
        config: KvStoreConfig,
    ) -> Result<(KvStoreHandle, SocketAddr, Task<()>), Error> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|error| Error::Io(IoError::BindError(error)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| Error::Io(IoError::BindError(error)))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (net_tx, net_rx) = mpsc::channel(256);

        let areas = config
            .areas
            .iter()
            .map(|area| {
                (area.clone(), AreaState::new(&config))
            })
            .collect();
        let token_bucket = TokenBucket::new(
            config.flood_rate.msgs_per_sec,
            config.flood_rate.burst_size,
        );

        let store = KvStore {
            _listener: net::listener_task(listener, net_tx.clone()),
            config,
            areas,
            subscribers: vec![],
            token_bucket,
            cmd_rx,
            net_rx,
            net_tx,
        };
        let task =
            Task::spawn(store.run().instrument(debug_span!("kvstore")));

        Ok((KvStoreHandle { cmd_tx }, local_addr, task))
    }

    async fn run(mut self) {
        loop {
            let ttl_deadline = self.next_ttl_deadline();
            let flood_deadline = self.next_flood_deadline();
            let deadline = [ttl_deadline, flood_deadline]
                .into_iter()
                .flatten()
                .min();

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // All handles are gone.
                        break;
                    };
                    self.process_command(cmd);
                }
                Some(event) = self.net_rx.recv() => {
                    self.process_net_event(event);
                }
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(
                        || Instant::now() + std::time::Duration::from_secs(3600),
                    ).into(),
                ), if deadline.is_some() => {
                    self.process_timers();
                }
            }
        }
    }

    fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetKeys {
                area,
                params,
                responder,
            } => {
                let result = self.set_keys(&area, params);
                let _ = responder.send(result);
            }
            Command::GetKeys {
                area,
                keys,
                responder,
            } => {
                let result = self.area(&area).map(|state| {
                    keys.iter()
                        .filter_map(|key| {
                            state
                                .key_vals
                                .get(key)
                                .map(|value| (key.clone(), value.clone()))
                        })
                        .collect()
                });
                let _ = responder.send(result);
            }
            Command::DumpKeys {
                area,
                params,
                responder,
            } => {
                let result = self
                    .area(&area)
                    .map(|state| state.key_vals.dump(&params));
                let _ = responder.send(result);
            }
            Command::DumpHashes {
                area,
                params,
                responder,
            } => {
                let result = self
                    .area(&area)
                    .map(|state| state.key_vals.dump_hashes(&params));
                let _ = responder.send(result);
            }
            Command::AddPeers {
                area,
                peers,
                responder,
            } => {
                let result = self.add_peers(&area, peers);
                let _ = responder.send(result);
            }
            Command::DelPeers {
                area,
                peers,
                responder,
            } => {
                let result = self.del_peers(&area, peers);
                let _ = responder.send(result);
            }
            Command::GetPeers { area, responder } => {
                let result = self.area(&area).map(|state| {
                    state
                        .peers
                        .iter()
                        .map(|(name, peer)| {
                            (
                                name.clone(),
                                PeerInfo {
                                    spec: peer.spec.clone(),
                                    initial_sync_done: peer
                                        .initial_sync_done,
                                },
                            )
                        })
                        .collect()
                });
                let _ = responder.send(result);
            }
            Command::Subscribe {
                include_snapshot,
                responder,
            } => {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
                let snapshot = include_snapshot.then(|| {
                    let mut snapshot = Publication::default();
                    for state in self.areas.values() {
                        snapshot.key_vals.extend(
                            state
                                .key_vals
                                .dump(&KeyDumpParams::default()),
                        );
                    }
                    snapshot
                });
                self.subscribers.push(tx);
                let _ = responder.send((snapshot, rx));
            }
            Command::SubscriberCount { responder } => {
                self.subscribers
                    .retain(|subscriber| !subscriber.is_closed());
                let _ = responder.send(self.subscribers.len());
            }
            Command::ProcessDualMessage {
                area,
                message,
                responder,
            } => {
                let result = self.process_dual_message(&area, message);
                let _ = responder.send(result);
            }
            Command::UpdateFloodTopologyChild {
                area,
                root,
                child,
                set,
                responder,
            } => {
                let result = self.area_mut(&area).map(|state| {
                    if let Some(topology) = &mut state.topology {
                        topology.set_child(&root, child, set);
                    }
                });
                let _ = responder.send(result);
            }
            Command::GetSpanningTreeInfos { area, responder } => {
                let result = self.area(&area).map(|state| {
                    state
                        .topology
                        .as_ref()
                        .map(|topology| topology.spt_infos())
                        .unwrap_or_default()
                });
                let _ = responder.send(result);
            }
            Command::GetCounters { responder } => {
                let counters = self.aggregate_counters();
                let _ = responder.send(counters);
            }
        }
    }

    fn process_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::SyncRequest {
                area,
                sender_id,
                digest,
                responder,
            } => {
                debug!(%area, peer = %sender_id, "full-sync request");
                let response = match self.area_mut(&area) {
                    Ok(state) => {
                        state.key_vals.counters_mut().full_sync_rounds += 1;
                        let stale = state.key_vals.stale_keys(&digest);
                        let key_vals = stale
                            .into_iter()
                            .filter_map(|key| {
                                state
                                    .key_vals
                                    .get(&key)
                                    .map(|value| (key, value.clone()))
                            })
                            .collect();
                        Message::FullSyncResponse {
                            key_vals,
                            digest: state.key_vals.digest(),
                        }
                    }
                    // Unknown area: answer with an empty sync so the
                    // peer doesn't retry forever.
                    Err(_) => Message::FullSyncResponse {
                        key_vals: BTreeMap::new(),
                        digest: BTreeMap::new(),
                    },
                };
                let _ = responder.send(response);
            }
            NetEvent::DigestRequest { area, responder } => {
                let digest = self
                    .area(&area)
                    .map(|state| state.key_vals.digest())
                    .unwrap_or_default();
                let _ = responder.send(digest);
            }
            NetEvent::ConnUp { area, node, sink } => {
                let Ok(state) = self.area_mut(&area) else {
                    return;
                };
                state.sinks.insert(node.clone(), sink);
                let actions = state
                    .topology
                    .as_mut()
                    .map(|topology| topology.peer_up(node));
                if let Some(actions) = actions {
                    self.run_dual_actions(&area, actions);
                }
            }
            NetEvent::ConnDown { area, node, sink } => {
                let Ok(state) = self.area_mut(&area) else {
                    return;
                };
                // Both directions of a mutual peering register under
                // the same name; only drop the sink belonging to the
                // connection that actually died.
                let matches = state
                    .sinks
                    .get(&node)
                    .map(|stored| stored.same_channel(&sink))
                    .unwrap_or(false);
                if !matches {
                    return;
                }
                state.sinks.remove(&node);
                let actions = state
                    .topology
                    .as_mut()
                    .map(|topology| topology.peer_down(&node));
                if let Some(actions) = actions {
                    self.run_dual_actions(&area, actions);
                }
            }
            NetEvent::SyncResponse {
                area,
                peer,
                key_vals,
                digest,
            } => {
                self.process_sync_response(&area, &peer, key_vals, digest);
            }
            NetEvent::Inbound { from, message } => {
                self.process_inbound(from, message);
            }
        }
    }

    fn process_inbound(&mut self, from: Option<String>, message: Message) {
        match message {
            Message::Flood {
                area,
                publication,
                sender_id,
            } => {
                let sender =
                    from.unwrap_or_else(|| sender_id.clone());
                let Ok(state) = self.area_mut(&area) else {
                    return;
                };
                state.key_vals.counters_mut().received_publications += 1;

                // Extend the path vector with the sender before
                // forwarding.
                let mut node_ids =
                    publication.node_ids.clone().unwrap_or_default();
                if !node_ids.contains(&sender) {
                    node_ids.push(sender.clone());
                }

                self.apply_key_vals(
                    &area,
                    publication.key_vals,
                    Some(node_ids),
                    Some(&sender),
                    SelfOrigin::Remote,
                );
                if !publication.expired_keys.is_empty() {
                    self.notify_subscribers(Publication {
                        expired_keys: publication.expired_keys,
                        ..Default::default()
                    });
                }
            }
            Message::Dual { area, message } => {
                let _ = self.process_dual_message(&area, message);
            }
            Message::FloodTopoSet {
                area,
                root,
                child,
                set,
            } => {
                if let Ok(state) = self.area_mut(&area) {
                    if let Some(topology) = &mut state.topology {
                        topology.set_child(&root, child, set);
                    }
                }
            }
            Message::FullSyncRequest { .. }
            | Message::FullSyncResponse { .. } => {
                // Sync messages are handled during connection setup.
                Error::UnexpectedMessage.log();
            }
        }
    }

    fn process_sync_response(
        &mut self,
        area: &Area,
        peer: &str,
        key_vals: BTreeMap<String, Value>,
        digest: BTreeMap<String, ValueDigest>,
    ) {
        // Merge what the peer knew better, flooding it onwards.
        self.apply_key_vals(
            area,
            key_vals,
            Some(vec![peer.to_owned()]),
            None,
            SelfOrigin::Remote,
        );

        // Push back whatever we hold that the peer is stale on.
        let node_name = self.config.node_name.clone();
        let Ok(state) = self.area_mut(area) else {
            return;
        };
        let stale = state.key_vals.stale_keys(&digest);
        if !stale.is_empty() {
            let key_vals = stale
                .into_iter()
                .filter_map(|key| {
                    state
                        .key_vals
                        .get(&key)
                        .map(|value| (key, value.clone()))
                })
                .collect();
            let publication = Publication {
                key_vals,
                expired_keys: vec![],
                node_ids: Some(vec![node_name.clone()]),
            };
            let message = Message::Flood {
                area: area.clone(),
                publication,
                sender_id: node_name,
            };
            if let Some(sink) = state.sinks.get(peer) {
                let _ = sink.try_send(message);
            }
        }
        if let Some(peer) = state.peers.get_mut(peer) {
            peer.initial_sync_done = true;
        }
        debug!(%area, %peer, "full-sync completed");
    }

    fn set_keys(
        &mut self,
        area: &Area,
        params: KeySetParams,
    ) -> Result<(), Error> {
        self.area(area)?;
        let track = if params.refresh_ttl {
            SelfOrigin::Refresh
        } else {
            SelfOrigin::Expire
        };
        self.apply_key_vals(
            area,
            params.key_vals,
            params.node_ids,
            None,
            track,
        );
        Ok(())
    }

    // Common merge path for local sets, floods and sync responses.
    fn apply_key_vals(
        &mut self,
        area: &Area,
        key_vals: BTreeMap<String, Value>,
        node_ids: Option<Vec<String>>,
        sender: Option<&str>,
        self_origin: SelfOrigin,
    ) {
        let node_name = self.config.node_name.clone();
        let now = Instant::now();
        let Ok(state) = self.area_mut(area) else {
            return;
        };

        let result = state.key_vals.merge_key_values(key_vals, now);

        // Track (or stop tracking) our own records for TTL refresh.
        if self_origin != SelfOrigin::Remote {
            for (key, value) in &result.updates {
                if value.originator_id != node_name {
                    continue;
                }
                match self_origin {
                    SelfOrigin::Refresh => {
                        state
                            .key_vals
                            .track_self_originated(key.clone(), now);
                    }
                    SelfOrigin::Expire => {
                        state.key_vals.untrack_self_originated(key);
                    }
                    SelfOrigin::Remote => (),
                }
            }
        }

        // A sender that pushed stale records gets the newer ones back.
        if let Some(sender) = sender {
            if !result.newer_than_sender.is_empty() {
                let message = Message::Flood {
                    area: area.clone(),
                    publication: Publication {
                        key_vals: result.newer_than_sender.clone(),
                        expired_keys: vec![],
                        node_ids: Some(vec![node_name.clone()]),
                    },
                    sender_id: node_name.clone(),
                };
                if let Some(sink) = state.sinks.get(sender) {
                    let _ = sink.try_send(message);
                }
            }
        }

        // Queue accepted updates and TTL refreshes for flooding, with
        // ourselves appended to the path vector.
        if !result.updates.is_empty() || !result.ttl_refreshes.is_empty() {
            let mut node_ids = node_ids.unwrap_or_default();
            if !node_ids.contains(&node_name) {
                node_ids.push(node_name);
            }
            let mut pending = result.updates.clone();
            pending.extend(result.ttl_refreshes);
            state.flood_buffer.push(pending, Some(node_ids));
        }

        // Subscribers only hear about real updates.
        if !result.updates.is_empty() {
            let publication = Publication {
                key_vals: result.updates,
                expired_keys: vec![],
                node_ids: None,
            };
            self.notify_subscribers(publication);
        }

        self.try_flood(area);
    }

    fn try_flood(&mut self, area: &Area) {
        let now = Instant::now();
        let Ok(state) = self.area_mut(area) else {
            return;
        };
        if state.flood_buffer.is_empty() {
            return;
        }
        if !self.token_bucket.try_consume(now) {
            // The flood timer picks this up once tokens accrue.
            if let Ok(state) = self.area_mut(area) {
                state.key_vals.counters_mut().flood_suppressions += 1;
            }
            return;
        }

        let node_name = self.config.node_name.clone();
        let Ok(state) = self.area_mut(area) else {
            return;
        };
        let publications = state.flood_buffer.drain();
        let targets = state.flood_targets();
        for publication in publications {
            let suppressed: &[String] = match &publication.node_ids {
                Some(node_ids) => node_ids,
                None => &[],
            };
            let message = Message::Flood {
                area: area.clone(),
                publication: publication.clone(),
                sender_id: node_name.clone(),
            };
            for target in &targets {
                if suppressed.contains(target) {
                    continue;
                }
                if let Some(sink) = state.sinks.get(target) {
                    let _ = sink.try_send(message.clone());
                }
            }
        }
    }

    fn process_dual_message(
        &mut self,
        area: &Area,
        message: DualMessage,
    ) -> Result<(), Error> {
        let state = self.area_mut(area)?;
        let actions = match &mut state.topology {
            Some(topology) => topology.process_message(message),
            None => return Ok(()),
        };
        self.run_dual_actions(area, actions);
        Ok(())
    }

    fn run_dual_actions(&mut self, area: &Area, actions: DualActions) {
        let node_name = self.config.node_name.clone();
        let Ok(state) = self.area_mut(area) else {
            return;
        };
        for (peer, message) in actions.messages {
            if let Some(sink) = state.sinks.get(&peer) {
                let _ = sink.try_send(Message::Dual {
                    area: area.clone(),
                    message,
                });
            }
        }
        for (peer, root, set) in actions.parent_updates {
            if let Some(sink) = state.sinks.get(&peer) {
                let _ = sink.try_send(Message::FloodTopoSet {
                    area: area.clone(),
                    root,
                    child: node_name.clone(),
                    set,
                });
            }
        }
    }

    fn add_peers(
        &mut self,
        area: &Area,
        peers: BTreeMap<String, PeerSpec>,
    ) -> Result<(), Error> {
        let node_name = self.config.node_name.clone();
        let net_tx = self.net_tx.clone();
        let state = self.area_mut(area)?;

        for (name, spec) in peers {
            // Re-adding with identical endpoints is a no-op.
            if let Some(existing) = state.peers.get(&name) {
                if existing.spec == spec {
                    continue;
                }
            }
            debug!(%area, peer = %name, "peer added");
            let task = net::peer_task(
                area.clone(),
                node_name.clone(),
                name.clone(),
                spec.clone(),
                net_tx.clone(),
            );
            state.peers.insert(
                name,
                Peer {
                    spec,
                    initial_sync_done: false,
                    _task: task,
                },
            );
        }
        Ok(())
    }

    fn del_peers(
        &mut self,
        area: &Area,
        peers: Vec<String>,
    ) -> Result<(), Error> {
        let state = self.area_mut(area)?;
        let mut actions = DualActions::default();
        for name in peers {
            debug!(%area, peer = %name, "peer deleted");
            state.peers.remove(&name);
            state.sinks.remove(&name);
            if let Some(topology) = &mut state.topology {
                let mut removed = topology.peer_down(&name);
                actions.messages.append(&mut removed.messages);
                actions
                    .parent_updates
                    .append(&mut removed.parent_updates);
            }
        }
        self.run_dual_actions(area, actions);
        Ok(())
    }

    fn process_timers(&mut self) {
        let now = Instant::now();
        let areas = self.areas.keys().cloned().collect::<Vec<_>>();
        for area in areas {
            let Ok(state) = self.area_mut(&area) else {
                continue;
            };

            // Expire overdue records.
            let expired = state.key_vals.expire_due(now);
            if !expired.is_empty() {
                // Announce expirations to peers and subscribers; each
                // node expires its own copy, this is advisory.
                let publication = Publication {
                    key_vals: BTreeMap::new(),
                    expired_keys: expired,
                    node_ids: Some(vec![self.config.node_name.clone()]),
                };
                self.send_expired(&area, publication.clone());
                self.notify_subscribers(publication);
            }

            // Refresh our own records ahead of expiry.
            let Ok(state) = self.area_mut(&area) else {
                continue;
            };
            let refreshes = state.key_vals.refresh_due(now);
            if !refreshes.is_empty() {
                state.flood_buffer.push(refreshes, None);
            }

            self.try_flood(&area);
        }
    }

    fn send_expired(&mut self, area: &Area, publication: Publication) {
        let node_name = self.config.node_name.clone();
        let Ok(state) = self.area_mut(area) else {
            return;
        };
        let message = Message::Flood {
            area: area.clone(),
            publication,
            sender_id: node_name,
        };
        for target in state.flood_targets() {
            if let Some(sink) = state.sinks.get(&target) {
                let _ = sink.try_send(message.clone());
            }
        }
    }

    fn notify_subscribers(&mut self, publication: Publication) {
        self.subscribers.retain(|subscriber| {
            subscriber.try_send(publication.clone()).is_ok()
                || !subscriber.is_closed()
        });
    }

    fn next_ttl_deadline(&self) -> Option<Instant> {
        self.areas
            .values()
            .filter_map(|state| state.key_vals.next_ttl_deadline())
            .min()
    }

    fn next_flood_deadline(&self) -> Option<Instant> {
        let pending = self
            .areas
            .values()
            .any(|state| !state.flood_buffer.is_empty());
        pending.then(|| {
            Instant::now()
                + self.token_bucket.time_until_available(Instant::now())
        })
    }

    fn aggregate_counters(&self) -> KvStoreCounters {
        let mut total = KvStoreCounters::default();
        for state in self.areas.values() {
            let counters = state.key_vals.counters();
            total.received_publications += counters.received_publications;
            total.received_key_vals += counters.received_key_vals;
            total.updated_key_vals += counters.updated_key_vals;
            total.expired_keys += counters.expired_keys;
            total.flood_suppressions += counters.flood_suppressions;
            total.full_sync_rounds += counters.full_sync_rounds;
            total.malformed_records += counters.malformed_records;
        }
        total
    }

    fn area(&self, area: &Area) -> Result<&AreaState, Error> {
        self.areas
            .get(area)
            .ok_or_else(|| Error::UnknownArea(area.clone()))
    }

    fn area_mut(&mut self, area: &Area) -> Result<&mut AreaState, Error> {
        self.areas
            .get_mut(area)
            .ok_or_else(|| Error::UnknownArea(area.clone()))
    }
}

// ===== impl AreaState =====

impl AreaState {
    fn new(config: &KvStoreConfig) -> AreaState {
        AreaState {
            key_vals: KeyValueMap::new(config.filters.clone()),
            peers: BTreeMap::new(),
            sinks: BTreeMap::new(),
            topology: config.enable_flood_optimization.then(|| {
                FloodTopology::new(
                    config.node_name.clone(),
                    config.is_flood_root,
                )
            }),
            flood_buffer: FloodBuffer::default(),
        }
    }

    // Nodes the next publication should go to: the spanning tree when
    // flood optimization is on, every connected node otherwise.
    fn flood_targets(&self) -> Vec<String> {
        match &self.topology {
            Some(topology) => topology.flood_peers().into_iter().collect(),
            None => self.sinks.keys().cloned().collect(),
        }
    }
}

// ===== impl KvStoreHandle =====

impl KvStoreHandle {
    pub async fn set_keys(
        &self,
        area: Area,
        params: KeySetParams,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SetKeys {
            area,
            params,
            responder,
        })
        .await?
    }

    pub async fn get_keys(
        &self,
        area: Area,
        keys: Vec<String>,
    ) -> Result<BTreeMap<String, Value>, Error> {
        self.request(|responder| Command::GetKeys {
            area,
            keys,
            responder,
        })
        .await?
    }

    pub async fn dump_keys(
        &self,
        area: Area,
        params: KeyDumpParams,
    ) -> Result<BTreeMap<String, Value>, Error> {
        self.request(|responder| Command::DumpKeys {
            area,
            params,
            responder,
        })
        .await?
    }

    pub async fn dump_hashes(
        &self,
        area: Area,
        params: KeyDumpParams,
    ) -> Result<BTreeMap<String, Value>, Error> {
        self.request(|responder| Command::DumpHashes {
            area,
            params,
            responder,
        })
        .await?
    }

    pub async fn add_peers(
        &self,
        area: Area,
        peers: BTreeMap<String, PeerSpec>,
    ) -> Result<(), Error> {
        self.request(|responder| Command::AddPeers {
            area,
            peers,
            responder,
        })
        .await?
    }

    pub async fn del_peers(
        &self,
        area: Area,
        peers: Vec<String>,
    ) -> Result<(), Error> {
        self.request(|responder| Command::DelPeers {
            area,
            peers,
            responder,
        })
        .await?
    }

    pub async fn get_peers(
        &self,
        area: Area,
    ) -> Result<BTreeMap<String, PeerInfo>, Error> {
        self.request(|responder| Command::GetPeers { area, responder })
            .await?
    }

    /// Subscribes to the publication stream.
    pub async fn subscribe(&self) -> Result<Receiver<Publication>, Error> {
        let (_, stream) = self
            .request(|responder| Command::Subscribe {
                include_snapshot: false,
                responder,
            })
            .await?;
        Ok(stream)
    }

    /// Subscribes and atomically returns the current contents as a
    /// snapshot publication.
    pub async fn subscribe_and_get(
        &self,
    ) -> Result<(Publication, Receiver<Publication>), Error> {
        let (snapshot, stream) = self
            .request(|responder| Command::Subscribe {
                include_snapshot: true,
                responder,
            })
            .await?;
        Ok((snapshot.unwrap_or_default(), stream))
    }

    pub async fn subscriber_count(&self) -> Result<usize, Error> {
        self.request(|responder| Command::SubscriberCount { responder })
            .await
    }

    pub async fn process_dual_message(
        &self,
        area: Area,
        message: DualMessage,
    ) -> Result<(), Error> {
        self.request(|responder| Command::ProcessDualMessage {
            area,
            message,
            responder,
        })
        .await?
    }

    pub async fn update_flood_topology_child(
        &self,
        area: Area,
        root: String,
        child: String,
        set: bool,
    ) -> Result<(), Error> {
        self.request(|responder| Command::UpdateFloodTopologyChild {
            area,
            root,
            child,
            set,
            responder,
        })
        .await?
    }

    pub async fn get_spanning_tree_infos(
        &self,
        area: Area,
    ) -> Result<Vec<SptInfo>, Error> {
        self.request(|responder| Command::GetSpanningTreeInfos {
            area,
            responder,
        })
        .await?
    }

    pub async fn get_counters(&self) -> Result<KvStoreCounters, Error> {
        self.request(|responder| Command::GetCounters { responder })
            .await
    }

    async fn request<T>(
        &self,
        make_cmd: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (responder, response) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(responder))
            .await
            .map_err(|_| Error::StoreShutDown)?;
        response.await.map_err(|_| Error::StoreShutDown)
    }
}
