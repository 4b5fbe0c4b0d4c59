//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod platform;

pub use platform::{MockPlatform, PlatformApi};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ipnetwork::IpNetwork;
use lattice_kvstore::types::{KeyDumpParams, KeySetParams, Value};
use lattice_kvstore::KvStoreHandle;
use lattice_utils::backoff::ExponentialBackoff;
use lattice_utils::mpls::Label;
use lattice_utils::routing::{
    AdjacencyDatabase, PerfEvents, RouteDatabase, RouteDatabaseDelta,
};
use lattice_utils::task::Task;
use lattice_utils::Area;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, warn, Instrument};

// Retained history of computation perf markers.
const PERF_DB_DEPTH: usize = 32;

// TTL on the convergence signaling key.
const SYNCED_KEY_TTL_MS: i64 = 300_000;

// Poll cadence while waiting for upstream convergence.
const ORDERED_FIB_POLL: Duration = Duration::from_millis(50);

/// Fib configuration.
#[derive(Clone, Debug)]
pub struct FibConfig {
    pub node_name: String,
    pub area: Area,
    // Maintain the intended set without touching the platform.
    pub dry_run: bool,
    // Periodic reconciliation cadence.
    pub sync_interval: Duration,
    // Backoff bounds for failed programming attempts.
    pub retry_min_backoff: Duration,
    pub retry_max_backoff: Duration,
    // Loop-free convergence signaling.
    pub ordered_fib: bool,
    // Upper bound on how long a delta waits for upstreams.
    pub ordered_fib_hold_max: Duration,
}

// Requests accepted by the fib task.
#[derive(Debug)]
enum Command {
    GetRouteDb {
        responder: oneshot::Sender<RouteDatabase>,
    },
    GetPerfDb {
        responder: oneshot::Sender<Vec<PerfEvents>>,
    },
}

/// Client handle to a running fib task.
#[derive(Clone, Debug)]
pub struct FibHandle {
    cmd_tx: Sender<Command>,
}

/// Forwarding plane agent.
///
/// Applies route deltas from the decision engine to the platform,
/// reconciles periodically, and retries failures under backoff.
pub struct Fib {
    config: FibConfig,
    platform: Box<dyn PlatformApi>,
    kvstore: KvStoreHandle,
    // The set we want programmed.
    intended: RouteDatabase,
    // Whether the first full programming happened yet.
    programmed_once: bool,
    // Routes whose last programming attempt failed.
    dirty_unicast: BTreeSet<IpNetwork>,
    dirty_mpls: BTreeSet<Label>,
    retry_backoff: ExponentialBackoff,
    perf_db: VecDeque<PerfEvents>,
    cmd_rx: Receiver<Command>,
    updates_rx: Receiver<RouteDatabaseDelta>,
}

// ===== impl Fib =====

impl Fib {
    /// Spawns the fib task consuming the given route delta stream.
    pub fn spawn(
        config: FibConfig,
        platform: Box<dyn PlatformApi>,
        kvstore: KvStoreHandle,
        updates_rx: Receiver<RouteDatabaseDelta>,
    ) -> (FibHandle, Task<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let fib = Fib {
            retry_backoff: ExponentialBackoff::new(
                config.retry_min_backoff,
                config.retry_max_backoff,
            ),
            config,
            platform,
            kvstore,
            intended: RouteDatabase::default(),
            programmed_once: false,
            dirty_unicast: BTreeSet::new(),
            dirty_mpls: BTreeSet::new(),
            perf_db: VecDeque::new(),
            cmd_rx,
            updates_rx,
        };
        let task = Task::spawn(fib.run().instrument(debug_span!("fib")));

        (FibHandle { cmd_tx }, task)
    }

    async fn run(mut self) {
        let mut sync = tokio::time::interval(self.config.sync_interval);
        sync.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Skip,
        );

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.process_command(cmd);
                }
                delta = self.updates_rx.recv() => {
                    let Some(delta) = delta else {
                        // Decision engine is gone.
                        break;
                    };
                    self.process_delta(delta).await;
                }
                _ = sync.tick() => {
                    self.reconcile().await;
                }
            }
        }
    }

    fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::GetRouteDb { responder } => {
                let _ = responder.send(self.intended.clone());
            }
            Command::GetPerfDb { responder } => {
                let _ = responder
                    .send(self.perf_db.iter().cloned().collect());
            }
        }
    }

    async fn process_delta(&mut self, mut delta: RouteDatabaseDelta) {
        // Update the intended set first; programming failures are
        // retried against it.
        for (prefix, next_hops) in &delta.unicast_routes_to_update {
            self.intended
                .unicast_routes
                .insert(*prefix, next_hops.clone());
        }
        for prefix in &delta.unicast_routes_to_delete {
            self.intended.unicast_routes.remove(prefix);
        }
        for (label, next_hops) in &delta.mpls_routes_to_update {
            self.intended.mpls_routes.insert(*label, next_hops.clone());
        }
        for label in &delta.mpls_routes_to_delete {
            self.intended.mpls_routes.remove(label);
        }

        if self.config.ordered_fib {
            self.wait_for_upstreams(&delta).await;
        }

        let success = if !self.programmed_once {
            // First delta: program the complete set.
            self.program_full().await
        } else {
            self.program_delta(&delta).await
        };

        if success {
            self.programmed_once = true;
            self.retry_backoff.report_success();
            self.publish_converged().await;
        } else {
            self.retry_backoff.report_error();
        }

        delta.perf_events.mark("FIB_PROGRAMMED");
        self.perf_db.push_back(delta.perf_events);
        if self.perf_db.len() > PERF_DB_DEPTH {
            self.perf_db.pop_front();
        }
    }

    async fn program_full(&mut self) -> bool {
        if self.config.dry_run {
            return true;
        }
        debug!(
            unicast = self.intended.unicast_routes.len(),
            mpls = self.intended.mpls_routes.len(),
            "programming full route set"
        );

        let unicast = self
            .intended
            .unicast_routes
            .iter()
            .map(|(prefix, next_hops)| (*prefix, next_hops.clone()))
            .collect();
        let mpls = self
            .intended
            .mpls_routes
            .iter()
            .map(|(label, next_hops)| (*label, next_hops.clone()))
            .collect();

        let mut ok = true;
        if let Err(error) = self.platform.add_unicast_routes(unicast).await
        {
            warn!(%error, "failed to program unicast routes");
            self.dirty_unicast
                .extend(self.intended.unicast_routes.keys().copied());
            ok = false;
        }
        if let Err(error) = self.platform.add_mpls_routes(mpls).await {
            warn!(%error, "failed to program mpls routes");
            self.dirty_mpls
                .extend(self.intended.mpls_routes.keys().copied());
            ok = false;
        }
        ok
    }

    async fn program_delta(&mut self, delta: &RouteDatabaseDelta) -> bool {
        if self.config.dry_run {
            return true;
        }

        let mut ok = true;
        if !delta.unicast_routes_to_delete.is_empty() {
            if let Err(error) = self
                .platform
                .delete_unicast_routes(
                    delta.unicast_routes_to_delete.clone(),
                )
                .await
            {
                warn!(%error, "failed to delete unicast routes");
                ok = false;
            }
        }
        if !delta.unicast_routes_to_update.is_empty() {
            let routes = delta
                .unicast_routes_to_update
                .iter()
                .map(|(prefix, next_hops)| (*prefix, next_hops.clone()))
                .collect();
            if let Err(error) =
                self.platform.add_unicast_routes(routes).await
            {
                warn!(%error, "failed to program unicast routes");
                self.dirty_unicast.extend(
                    delta.unicast_routes_to_update.keys().copied(),
                );
                ok = false;
            }
        }
        if !delta.mpls_routes_to_delete.is_empty() {
            if let Err(error) = self
                .platform
                .delete_mpls_routes(delta.mpls_routes_to_delete.clone())
                .await
            {
                warn!(%error, "failed to delete mpls routes");
                ok = false;
            }
        }
        if !delta.mpls_routes_to_update.is_empty() {
            let routes = delta
                .mpls_routes_to_update
                .iter()
                .map(|(label, next_hops)| (*label, next_hops.clone()))
                .collect();
            if let Err(error) = self.platform.add_mpls_routes(routes).await
            {
                warn!(%error, "failed to program mpls routes");
                self.dirty_mpls
                    .extend(delta.mpls_routes_to_update.keys().copied());
                ok = false;
            }
        }
        ok
    }

    // Periodic reconciliation: converge the platform onto the intended
    // set and re-attempt previously failed routes.
    async fn reconcile(&mut self) {
        if self.config.dry_run || !self.programmed_once {
            return;
        }
        if !self.retry_backoff.can_try_now() {
            return;
        }

        let platform_unicast = match self.platform.get_route_table().await
        {
            Ok(table) => table,
            Err(error) => {
                warn!(%error, "failed to read platform route table");
                self.retry_backoff.report_error();
                return;
            }
        };
        let platform_mpls = match self.platform.get_mpls_table().await {
            Ok(table) => table,
            Err(error) => {
                warn!(%error, "failed to read platform mpls table");
                self.retry_backoff.report_error();
                return;
            }
        };

        // Missing or different routes are (re)programmed, unknown ones
        // removed.
        let to_add = self
            .intended
            .unicast_routes
            .iter()
            .filter(|(prefix, next_hops)| {
                platform_unicast.get(*prefix) != Some(*next_hops)
                    || self.dirty_unicast.contains(*prefix)
            })
            .map(|(prefix, next_hops)| (*prefix, next_hops.clone()))
            .collect::<Vec<_>>();
        let to_delete = platform_unicast
            .keys()
            .filter(|prefix| {
                !self.intended.unicast_routes.contains_key(*prefix)
            })
            .copied()
            .collect::<Vec<_>>();
        let mpls_to_add = self
            .intended
            .mpls_routes
            .iter()
            .filter(|(label, next_hops)| {
                platform_mpls.get(*label) != Some(*next_hops)
                    || self.dirty_mpls.contains(*label)
            })
            .map(|(label, next_hops)| (*label, next_hops.clone()))
            .collect::<Vec<_>>();
        let mpls_to_delete = platform_mpls
            .keys()
            .filter(|label| {
                !self.intended.mpls_routes.contains_key(*label)
            })
            .copied()
            .collect::<Vec<_>>();

        if to_add.is_empty()
            && to_delete.is_empty()
            && mpls_to_add.is_empty()
            && mpls_to_delete.is_empty()
        {
            return;
        }
        debug!(
            add = to_add.len(),
            delete = to_delete.len(),
            mpls_add = mpls_to_add.len(),
            mpls_delete = mpls_to_delete.len(),
            "reconciling platform state"
        );

        let mut ok = true;
        if !to_delete.is_empty() {
            ok &= self
                .platform
                .delete_unicast_routes(to_delete)
                .await
                .is_ok();
        }
        if !to_add.is_empty() {
            ok &=
                self.platform.add_unicast_routes(to_add).await.is_ok();
        }
        if !mpls_to_delete.is_empty() {
            ok &= self
                .platform
                .delete_mpls_routes(mpls_to_delete)
                .await
                .is_ok();
        }
        if !mpls_to_add.is_empty() {
            ok &= self.platform.add_mpls_routes(mpls_to_add).await.is_ok();
        }

        if ok {
            self.dirty_unicast.clear();
            self.dirty_mpls.clear();
            self.retry_backoff.report_success();
        } else {
            self.retry_backoff.report_error();
        }
    }

    // Ordered FIB: hold this delta until every upstream next-hop node
    // has signaled convergence at least as fresh as the computation
    // that produced it, bounded by the configured hold.
    async fn wait_for_upstreams(&mut self, delta: &RouteDatabaseDelta) {
        let spf_start_ms = delta
            .perf_events
            .events
            .first()
            .map(|event| event.unix_ts_ms)
            .unwrap_or_default();
        let next_hop_addrs = delta
            .unicast_routes_to_update
            .values()
            .flatten()
            .map(|next_hop| next_hop.address)
            .collect::<BTreeSet<_>>();
        if next_hop_addrs.is_empty() {
            return;
        }

        let deadline =
            tokio::time::Instant::now() + self.config.ordered_fib_hold_max;
        loop {
            if self.upstreams_converged(&next_hop_addrs, spf_start_ms).await
            {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("upstream convergence wait timed out");
                return;
            }
            tokio::time::sleep(ORDERED_FIB_POLL).await;
        }
    }

    async fn upstreams_converged(
        &self,
        next_hop_addrs: &BTreeSet<std::net::IpAddr>,
        spf_start_ms: u64,
    ) -> bool {
        // Map next-hop addresses back to node names through the
        // advertised adjacency databases.
        let adj_dump = self
            .kvstore
            .dump_keys(
                self.config.area.clone(),
                KeyDumpParams {
                    prefix: Some("adj:".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_or_default();
        let mut upstreams = BTreeSet::new();
        for value in adj_dump.values() {
            let Some(bytes) = &value.value else {
                continue;
            };
            let Ok((db, _)) = bincode::serde::decode_from_slice::<
                AdjacencyDatabase,
                _,
            >(bytes, bincode::config::standard()) else {
                continue;
            };
            // Our own advertisement lists each neighbor with the
            // neighbor's link addresses; a match names the upstream.
            if db.this_node_name != self.config.node_name {
                continue;
            }
            for adjacency in &db.adjacencies {
                let matches = adjacency
                    .v6_addr
                    .map(|addr| next_hop_addrs.contains(&addr))
                    .unwrap_or(false)
                    || adjacency
                        .v4_addr
                        .map(|addr| next_hop_addrs.contains(&addr))
                        .unwrap_or(false);
                if matches {
                    upstreams
                        .insert(adjacency.other_node_name.clone());
                }
            }
        }
        if upstreams.is_empty() {
            return true;
        }

        let synced_dump = self
            .kvstore
            .dump_keys(
                self.config.area.clone(),
                KeyDumpParams {
                    prefix: Some("fib:synced:".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_or_default();

        upstreams.iter().all(|upstream| {
            let key = synced_key(upstream);
            synced_dump
                .get(&key)
                .and_then(|value| value.value.as_ref())
                .and_then(|bytes| {
                    bincode::serde::decode_from_slice::<u64, _>(
                        bytes,
                        bincode::config::standard(),
                    )
                    .ok()
                })
                .map(|(converged_ms, _)| converged_ms >= spf_start_ms)
                .unwrap_or(false)
        })
    }

    // Publishes our own convergence timestamp for downstream nodes.
    async fn publish_converged(&self) {
        if !self.config.ordered_fib {
            return;
        }
        let key = synced_key(&self.config.node_name);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let Ok(payload) = bincode::serde::encode_to_vec(
            &now_ms,
            bincode::config::standard(),
        ) else {
            return;
        };

        // Bump past whatever version is already out there.
        let current = self
            .kvstore
            .get_keys(self.config.area.clone(), vec![key.clone()])
            .await
            .ok()
            .and_then(|found| {
                found.get(&key).map(|value| value.version)
            })
            .unwrap_or(0);
        let value = Value::new(
            current + 1,
            self.config.node_name.clone(),
            Bytes::from(payload),
            SYNCED_KEY_TTL_MS,
        );
        let params = KeySetParams {
            key_vals: BTreeMap::from([(key, value)]),
            refresh_ttl: true,
            ..Default::default()
        };
        if let Err(error) = self
            .kvstore
            .set_keys(self.config.area.clone(), params)
            .await
        {
            warn!(%error, "failed to publish convergence key");
        }
    }
}

// ===== impl FibHandle =====

impl FibHandle {
    /// Returns the intended route database.
    pub async fn get_route_db(&self) -> Result<RouteDatabase, Error> {
        self.request(|responder| Command::GetRouteDb { responder })
            .await
    }

    /// Returns the recent computation perf markers.
    pub async fn get_perf_db(&self) -> Result<Vec<PerfEvents>, Error> {
        self.request(|responder| Command::GetPerfDb { responder })
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

// Fib errors.
#[derive(Debug)]
pub enum Error {
    TaskShutDown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::TaskShutDown => {
                write!(f, "fib task is not running")
            }
        }
    }
}

impl std::error::Error for Error {}

// ===== helper functions =====

fn synced_key(node_name: &str) -> String {
    format!("fib:synced:{}", node_name)
}
