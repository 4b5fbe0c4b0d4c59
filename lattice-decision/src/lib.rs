//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod error;
pub mod graph;
pub mod route;
pub mod spf;

pub use error::Error;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use lattice_kvstore::types::Publication;
use lattice_kvstore::KvStoreHandle;
use lattice_utils::routing::{
    is_routing_key, AdjacencyDatabase, PerfEvents, PrefixDatabase,
    RouteDatabase, RouteDatabaseDelta,
};
use lattice_utils::task::Task;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, Instrument};

use crate::graph::Topology;
use crate::route::{compute_delta, compute_routes, PrefixAdvertisements};

/// Decision configuration.
#[derive(Clone, Debug)]
pub struct DecisionConfig {
    pub node_name: String,
    // Debounce window between a topology event and the SPF run.
    pub debounce_min: Duration,
    // Ceiling on how long a busy topology can postpone the run.
    pub debounce_max: Duration,
}

// Requests accepted by the decision task.
#[derive(Debug)]
enum Command {
    GetRouteDb {
        responder: oneshot::Sender<RouteDatabase>,
    },
    GetRouteDbComputed {
        node: Option<String>,
        responder: oneshot::Sender<RouteDatabase>,
    },
    GetAdjacencyDbs {
        responder: oneshot::Sender<BTreeMap<String, AdjacencyDatabase>>,
    },
    GetPrefixDbs {
        responder: oneshot::Sender<BTreeMap<String, PrefixDatabase>>,
    },
}

/// Client handle to a running decision task.
#[derive(Clone, Debug)]
pub struct DecisionHandle {
    cmd_tx: Sender<Command>,
}

/// Debounced shortest-path engine.
///
/// Consumes `adj:` and `prefix:` records from the KvStore, rebuilds the
/// topology graph and emits route database deltas to the FIB.
pub struct Decision {
    config: DecisionConfig,
    // Last decoded advertisement per node.
    adj_dbs: BTreeMap<String, AdjacencyDatabase>,
    // Last decoded prefix advertisement per KvStore key.
    prefix_dbs: BTreeMap<String, PrefixDatabase>,
    route_db: RouteDatabase,
    // Debounce state.
    first_pending: Option<Instant>,
    last_event: Option<Instant>,
    cmd_rx: Receiver<Command>,
    kv_stream: Receiver<Publication>,
    updates_tx: Sender<RouteDatabaseDelta>,
}

// ===== impl Decision =====

impl Decision {
    /// Subscribes to the KvStore and spawns the decision task. Returns
    /// the handle, the route delta stream and the task.
    pub async fn spawn(
        config: DecisionConfig,
        kvstore: &KvStoreHandle,
    ) -> Result<
        (DecisionHandle, Receiver<RouteDatabaseDelta>, Task<()>),
        Error,
    > {
        let (snapshot, kv_stream) = kvstore.subscribe_and_get().await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (updates_tx, updates_rx) = mpsc::channel(16);

        let mut decision = Decision {
            config,
            adj_dbs: BTreeMap::new(),
            prefix_dbs: BTreeMap::new(),
            route_db: RouteDatabase::default(),
            first_pending: None,
            last_event: None,
            cmd_rx,
            kv_stream,
            updates_tx,
        };
        decision.process_publication(snapshot);

        let task = Task::spawn(
            decision.run().instrument(debug_span!("decision")),
        );
        Ok((DecisionHandle { cmd_tx }, updates_rx, task))
    }

    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.process_command(cmd);
                }
                publication = self.kv_stream.recv() => {
                    let Some(publication) = publication else {
                        // Store is gone; nothing left to compute from.
                        break;
                    };
                    self.process_publication(publication);
                }
                _ = tokio::time::sleep_until(
                    deadline
                        .unwrap_or_else(|| {
                            Instant::now() + Duration::from_secs(3600)
                        })
                        .into(),
                ), if deadline.is_some() => {
                    self.compute_and_emit().await;
                }
            }
        }
    }

    fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::GetRouteDb { responder } => {
                let _ = responder.send(self.route_db.clone());
            }
            Command::GetRouteDbComputed { node, responder } => {
                let root =
                    node.unwrap_or_else(|| self.config.node_name.clone());
                let topology = Topology::build(&self.adj_dbs);
                let route_db = compute_routes(
                    &root,
                    &topology,
                    &self.adj_dbs,
                    &self.prefix_advertisements(),
                );
                let _ = responder.send(route_db);
            }
            Command::GetAdjacencyDbs { responder } => {
                let _ = responder.send(self.adj_dbs.clone());
            }
            Command::GetPrefixDbs { responder } => {
                let _ = responder.send(self.prefix_dbs.clone());
            }
        }
    }

    fn process_publication(&mut self, publication: Publication) {
        let mut touched = false;

        for (key, value) in &publication.key_vals {
            if !is_routing_key(key) {
                continue;
            }
            // TTL refreshes carry no payload and change nothing here.
            let Some(bytes) = &value.value else {
                continue;
            };

            if let Some(node) = key.strip_prefix("adj:") {
                let node =
                    node.split(':').next().unwrap_or(node).to_owned();
                match decode::<AdjacencyDatabase>(bytes) {
                    Ok(db) => {
                        self.adj_dbs.insert(node, db);
                        touched = true;
                    }
                    Err(error) => {
                        Error::ValueDecode(key.clone(), error).log();
                    }
                }
            } else if key.starts_with("prefix:") {
                match decode::<PrefixDatabase>(bytes) {
                    Ok(db) if db.delete_prefix => {
                        touched |=
                            self.prefix_dbs.remove(key).is_some();
                    }
                    Ok(db) => {
                        self.prefix_dbs.insert(key.clone(), db);
                        touched = true;
                    }
                    Err(error) => {
                        Error::ValueDecode(key.clone(), error).log();
                    }
                }
            }
        }

        for key in &publication.expired_keys {
            if let Some(node) = key.strip_prefix("adj:") {
                let node = node.split(':').next().unwrap_or(node);
                touched |= self.adj_dbs.remove(node).is_some();
            } else if key.starts_with("prefix:") {
                touched |= self.prefix_dbs.remove(key).is_some();
            }
        }

        if touched {
            let now = Instant::now();
            self.first_pending.get_or_insert(now);
            self.last_event = Some(now);
        }
    }

    // The debounce window: min delay after the last event, capped at
    // max delay after the first.
    fn next_deadline(&self) -> Option<Instant> {
        let first = self.first_pending?;
        let last = self.last_event.unwrap_or(first);
        Some(
            (last + self.config.debounce_min)
                .min(first + self.config.debounce_max),
        )
    }

    async fn compute_and_emit(&mut self) {
        self.first_pending = None;
        self.last_event = None;

        let mut perf_events = PerfEvents {
            node_name: self.config.node_name.clone(),
            events: vec![],
        };
        perf_events.mark("DECISION_SPF_START");

        let topology = Topology::build(&self.adj_dbs);
        let route_db = compute_routes(
            &self.config.node_name,
            &topology,
            &self.adj_dbs,
            &self.prefix_advertisements(),
        );
        perf_events.mark("DECISION_SPF_DONE");

        let mut delta = compute_delta(&self.route_db, &route_db);
        debug!(
            unicast = route_db.unicast_routes.len(),
            mpls = route_db.mpls_routes.len(),
            updated = delta.unicast_routes_to_update.len(),
            deleted = delta.unicast_routes_to_delete.len(),
            "spf run complete"
        );
        self.route_db = route_db;

        if !delta.is_empty() {
            delta.perf_events = perf_events;
            let _ = self.updates_tx.send(delta).await;
        }
    }

    fn prefix_advertisements(
        &self,
    ) -> BTreeMap<IpNetwork, PrefixAdvertisements> {
        let mut prefixes: BTreeMap<IpNetwork, PrefixAdvertisements> =
            BTreeMap::new();
        for db in self.prefix_dbs.values() {
            for entry in &db.prefix_entries {
                prefixes.entry(entry.prefix).or_default().push((
                    db.this_node_name.clone(),
                    entry.clone(),
                ));
            }
        }
        prefixes
    }
}

// ===== impl DecisionHandle =====

impl DecisionHandle {
    /// Returns the route database of the last computation.
    pub async fn get_route_db(&self) -> Result<RouteDatabase, Error> {
        self.request(|responder| Command::GetRouteDb { responder })
            .await
    }

    /// Computes a route database rooted at the given node on demand.
    pub async fn get_route_db_computed(
        &self,
        node: Option<String>,
    ) -> Result<RouteDatabase, Error> {
        self.request(|responder| Command::GetRouteDbComputed {
            node,
            responder,
        })
        .await
    }

    pub async fn get_adjacency_dbs(
        &self,
    ) -> Result<BTreeMap<String, AdjacencyDatabase>, Error> {
        self.request(|responder| Command::GetAdjacencyDbs { responder })
            .await
    }

    pub async fn get_prefix_dbs(
        &self,
    ) -> Result<BTreeMap<String, PrefixDatabase>, Error> {
        self.request(|responder| Command::GetPrefixDbs { responder })
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
            .map_err(|_| Error::TaskShutDown)?;
        response.await.map_err(|_| Error::TaskShutDown)
    }
}

// ===== helper functions =====

fn decode<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
}
