//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use ipnetwork::IpNetwork;
use lattice_config_store::ConfigStoreHandle;
use lattice_kvstore::types::{KeySetParams, Value};
use lattice_kvstore::KvStoreHandle;
use lattice_prefix_manager::PrefixManagerHandle;
use lattice_spark::{InterfaceInfo, NeighborInfo, NeighborUpdate, SparkHandle};
use lattice_utils::backoff::ExponentialBackoff;
use lattice_utils::routing::{
    adj_key, Adjacency, AdjacencyDatabase, ForwardingAlgorithm,
    ForwardingType, PrefixEntry, PrefixType,
};
use lattice_utils::task::{Task, TimeoutTask};
use lattice_utils::Area;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, warn, Instrument};

// Config store key holding the operator overrides.
const OVERRIDES_KEY: &str = "link-monitor:overrides";

// Default adjacency metric when no override applies.
const DEFAULT_METRIC: u32 = 1;

/// LinkMonitor configuration.
#[derive(Clone, Debug)]
pub struct LinkMonitorConfig {
    pub node_name: String,
    pub areas: Vec<Area>,
    // Segment-routing label identifying this node.
    pub node_label: u32,
    // Interface filters; an empty include set admits everything.
    pub include_interface_regexes: Vec<String>,
    pub exclude_interface_regexes: Vec<String>,
    // Interfaces whose global prefixes are redistributed.
    pub redistribute_interface_regexes: Vec<String>,
    // Link flap dampening bounds.
    pub flap_initial_backoff: Duration,
    pub flap_max_backoff: Duration,
    // Adjacency re-advertisement debounce.
    pub adv_throttle: Duration,
    pub adj_ttl_ms: i64,
}

/// Platform link and address events consumed by the monitor.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Up { if_name: String, ifindex: u32 },
    Down { if_name: String },
    AddrAdd { if_name: String, addr: IpNetwork },
    AddrDel { if_name: String, addr: IpNetwork },
}

/// Introspection snapshot of one interface.
#[derive(Clone, Debug)]
pub struct InterfaceDetails {
    pub if_name: String,
    pub ifindex: u32,
    pub is_up: bool,
    pub is_dampened: bool,
    pub backoff_remaining: Duration,
    pub addrs: Vec<IpNetwork>,
    pub is_overloaded: bool,
    pub metric_override: Option<u32>,
}

// Operator overrides, persisted across restarts.
#[derive(Debug, Default)]
#[derive(Deserialize, Serialize)]
struct Overrides {
    node_overloaded: bool,
    interface_overloads: BTreeSet<String>,
    interface_metrics: BTreeMap<String, u32>,
    adjacency_metrics: BTreeMap<(String, String), u32>,
}

// Requests accepted by the link monitor task.
#[derive(Debug)]
enum Command {
    SetNodeOverload {
        value: bool,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    SetInterfaceOverload {
        if_name: String,
        value: bool,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    SetInterfaceMetric {
        if_name: String,
        metric: Option<u32>,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    SetAdjacencyMetric {
        if_name: String,
        adj_node: String,
        metric: Option<u32>,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    GetInterfaces {
        responder: oneshot::Sender<Vec<InterfaceDetails>>,
    },
}

// Flap dampening timer expirations.
#[derive(Debug)]
enum TimerMsg {
    FlapEnd { if_name: String },
    StableEnd { if_name: String },
}

/// Client handle to a running link monitor task.
#[derive(Clone, Debug)]
pub struct LinkMonitorHandle {
    cmd_tx: Sender<Command>,
}

// Per-interface link state.
struct Interface {
    ifindex: u32,
    up: bool,
    // Held down by flap dampening.
    dampened: bool,
    addrs: BTreeSet<IpNetwork>,
    backoff: ExponentialBackoff,
    flap_timer: Option<TimeoutTask>,
    stable_timer: Option<TimeoutTask>,
}

// One established adjacency.
struct AdjEntry {
    info: NeighborInfo,
    since_unix: i64,
}

/// Owner of the local adjacency database.
///
/// Consumes platform link events and spark neighbor events, applies
/// operator overrides, dampens flapping links and originates the
/// adjacency database into the KvStore.
pub struct LinkMonitor {
    config: LinkMonitorConfig,
    spark: SparkHandle,
    kvstore: KvStoreHandle,
    prefix_manager: PrefixManagerHandle,
    config_store: ConfigStoreHandle,
    include: RegexSet,
    exclude: RegexSet,
    redistribute: RegexSet,
    interfaces: BTreeMap<String, Interface>,
    adjacencies: BTreeMap<(String, String), AdjEntry>,
    overrides: Overrides,
    // Debounced re-advertisement.
    pending_since: Option<Instant>,
    cmd_rx: Receiver<Command>,
    neighbor_events: Receiver<NeighborUpdate>,
    link_events: Receiver<LinkEvent>,
    timer_rx: Receiver<TimerMsg>,
    timer_tx: Sender<TimerMsg>,
}

// ===== impl LinkMonitor =====

impl LinkMonitor {
    /// Restores persisted overrides and spawns the task.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        config: LinkMonitorConfig,
        spark: SparkHandle,
        kvstore: KvStoreHandle,
        prefix_manager: PrefixManagerHandle,
        config_store: ConfigStoreHandle,
        neighbor_events: Receiver<NeighborUpdate>,
        link_events: Receiver<LinkEvent>,
    ) -> Result<(LinkMonitorHandle, Task<()>), Error> {
        let include = RegexSet::new(&config.include_interface_regexes)
            .map_err(Error::InvalidRegex)?;
        let exclude = RegexSet::new(&config.exclude_interface_regexes)
            .map_err(Error::InvalidRegex)?;
        let redistribute =
            RegexSet::new(&config.redistribute_interface_regexes)
                .map_err(Error::InvalidRegex)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (timer_tx, timer_rx) = mpsc::channel(64);

        let mut monitor = LinkMonitor {
            config,
            spark,
            kvstore,
            prefix_manager,
            config_store,
            include,
            exclude,
            redistribute,
            interfaces: BTreeMap::new(),
            adjacencies: BTreeMap::new(),
            overrides: Overrides::default(),
            pending_since: None,
            cmd_rx,
            neighbor_events,
            link_events,
            timer_rx,
            timer_tx,
        };
        monitor.restore_overrides().await;

        let task = Task::spawn(
            monitor.run().instrument(debug_span!("link-monitor")),
        );
        Ok((LinkMonitorHandle { cmd_tx }, task))
    }

    async fn restore_overrides(&mut self) {
        let persisted = match self
            .config_store
            .get_config_key(OVERRIDES_KEY.to_owned())
            .await
        {
            Ok(bytes) => bytes,
            Err(lattice_config_store::Error::NotFound(_)) => return,
            Err(error) => {
                warn!(%error, "failed to restore overrides");
                return;
            }
        };
        match bincode::serde::decode_from_slice(
            &persisted,
            bincode::config::standard(),
        ) {
            Ok((overrides, _)) => {
                self.overrides = overrides;
                debug!("operator overrides restored");
            }
            Err(error) => {
                warn!(%error, "persisted overrides are corrupt");
            }
        }
    }

    async fn persist_overrides(&self) {
        let payload = match bincode::serde::encode_to_vec(
            &self.overrides,
            bincode::config::standard(),
        ) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode overrides");
                return;
            }
        };
        if let Err(error) = self
            .config_store
            .set_config_key(
                OVERRIDES_KEY.to_owned(),
                Bytes::from(payload),
            )
            .await
        {
            warn!(%error, "failed to persist overrides");
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self
                .pending_since
                .map(|since| since + self.config.adv_throttle);

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.process_command(cmd).await;
                }
                Some(event) = self.neighbor_events.recv() => {
                    self.process_neighbor_event(event);
                }
                Some(event) = self.link_events.recv() => {
                    self.process_link_event(event).await;
                }
                Some(timer) = self.timer_rx.recv() => {
                    self.process_timer(timer).await;
                }
                _ = tokio::time::sleep_until(
                    deadline
                        .unwrap_or_else(|| {
                            Instant::now() + Duration::from_secs(3600)
                        })
                        .into(),
                ), if deadline.is_some() => {
                    self.pending_since = None;
                    self.advertise_adjacencies().await;
                }
            }
        }
    }

    async fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetNodeOverload { value, responder } => {
                debug!(%value, "node overload");
                self.overrides.node_overloaded = value;
                self.persist_overrides().await;
                self.schedule_advertisement();
                let _ = responder.send(Ok(()));
            }
            Command::SetInterfaceOverload {
                if_name,
                value,
                responder,
            } => {
                let result = if self.interfaces.contains_key(&if_name) {
                    debug!(%if_name, %value, "interface overload");
                    if value {
                        self.overrides
                            .interface_overloads
                            .insert(if_name);
                    } else {
                        self.overrides
                            .interface_overloads
                            .remove(&if_name);
                    }
                    self.persist_overrides().await;
                    self.schedule_advertisement();
                    Ok(())
                } else {
                    Err(Error::InterfaceNotFound(if_name))
                };
                let _ = responder.send(result);
            }
            Command::SetInterfaceMetric {
                if_name,
                metric,
                responder,
            } => {
                let result = if self.interfaces.contains_key(&if_name) {
                    debug!(%if_name, ?metric, "interface metric");
                    match metric {
                        Some(metric) => {
                            self.overrides
                                .interface_metrics
                                .insert(if_name, metric);
                        }
                        None => {
                            self.overrides
                                .interface_metrics
                                .remove(&if_name);
                        }
                    }
                    self.persist_overrides().await;
                    self.schedule_advertisement();
                    Ok(())
                } else {
                    Err(Error::InterfaceNotFound(if_name))
                };
                let _ = responder.send(result);
            }
            Command::SetAdjacencyMetric {
                if_name,
                adj_node,
                metric,
                responder,
            } => {
                debug!(%if_name, %adj_node, ?metric, "adjacency metric");
                let key = (if_name, adj_node);
                match metric {
                    Some(metric) => {
                        self.overrides
                            .adjacency_metrics
                            .insert(key, metric);
                    }
                    None => {
                        self.overrides.adjacency_metrics.remove(&key);
                    }
                }
                self.persist_overrides().await;
                self.schedule_advertisement();
                let _ = responder.send(Ok(()));
            }
            Command::GetInterfaces { responder } => {
                let details = self
                    .interfaces
                    .iter()
                    .map(|(if_name, iface)| InterfaceDetails {
                        if_name: if_name.clone(),
                        ifindex: iface.ifindex,
                        is_up: iface.up,
                        is_dampened: iface.dampened,
                        backoff_remaining: iface
                            .backoff
                            .time_until_retry(),
                        addrs: iface.addrs.iter().copied().collect(),
                        is_overloaded: self
                            .overrides
                            .interface_overloads
                            .contains(if_name),
                        metric_override: self
                            .overrides
                            .interface_metrics
                            .get(if_name)
                            .copied(),
                    })
                    .collect();
                let _ = responder.send(details);
            }
        }
    }

    fn process_neighbor_event(&mut self, event: NeighborUpdate) {
        match event {
            NeighborUpdate::Up(info) | NeighborUpdate::Restarted(info) => {
                debug!(
                    neighbor = %info.node_name,
                    interface = %info.if_name,
                    "adjacency up"
                );
                let key = (info.if_name.clone(), info.node_name.clone());
                self.adjacencies.insert(
                    key,
                    AdjEntry {
                        info,
                        since_unix: unix_now(),
                    },
                );
                self.schedule_advertisement();
            }
            NeighborUpdate::Down { node_name, if_name } => {
                debug!(
                    neighbor = %node_name,
                    interface = %if_name,
                    "adjacency down"
                );
                self.adjacencies.remove(&(if_name, node_name));
                self.schedule_advertisement();
            }
            NeighborUpdate::Restarting { .. } => {
                // Forwarding state is retained across a graceful
                // restart; nothing to re-advertise.
            }
            NeighborUpdate::RttChange {
                node_name,
                if_name,
                rtt_us,
            } => {
                if let Some(entry) =
                    self.adjacencies.get_mut(&(if_name, node_name))
                {
                    entry.info.rtt_us = Some(rtt_us);
                    self.schedule_advertisement();
                }
            }
        }
    }

    async fn process_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up { if_name, ifindex } => {
                if !self.interface_admitted(&if_name) {
                    return;
                }
                let flap_bounds = (
                    self.config.flap_initial_backoff,
                    self.config.flap_max_backoff,
                );
                let iface = self
                    .interfaces
                    .entry(if_name.clone())
                    .or_insert_with(|| Interface {
                        ifindex,
                        up: false,
                        dampened: false,
                        addrs: BTreeSet::new(),
                        backoff: ExponentialBackoff::new(
                            flap_bounds.0,
                            flap_bounds.1,
                        ),
                        flap_timer: None,
                        stable_timer: None,
                    });
                iface.ifindex = ifindex;
                iface.up = true;

                if iface.backoff.can_try_now() {
                    iface.dampened = false;
                    iface.flap_timer = None;
                    let stable_timer = stable_timer(
                        &self.timer_tx,
                        &if_name,
                        self.config.flap_max_backoff,
                    );
                    self.interfaces
                        .get_mut(&if_name)
                        .unwrap()
                        .stable_timer = Some(stable_timer);
                } else {
                    // Still inside the dampening window.
                    debug!(interface = %if_name, "link up dampened");
                    let remaining = iface.backoff.time_until_retry();
                    let flap_timer =
                        flap_timer(&self.timer_tx, &if_name, remaining);
                    let iface =
                        self.interfaces.get_mut(&if_name).unwrap();
                    iface.dampened = true;
                    iface.flap_timer = Some(flap_timer);
                }

                self.sync_spark().await;
                self.redistribute_prefixes().await;
                self.schedule_advertisement();
            }
            LinkEvent::Down { if_name } => {
                let Some(iface) = self.interfaces.get_mut(&if_name)
                else {
                    return;
                };
                debug!(interface = %if_name, "link down");
                iface.up = false;
                iface.stable_timer = None;
                iface.backoff.report_error();

                self.sync_spark().await;
                self.redistribute_prefixes().await;
                self.schedule_advertisement();
            }
            LinkEvent::AddrAdd { if_name, addr } => {
                let Some(iface) = self.interfaces.get_mut(&if_name)
                else {
                    return;
                };
                iface.addrs.insert(addr);
                self.sync_spark().await;
                self.redistribute_prefixes().await;
            }
            LinkEvent::AddrDel { if_name, addr } => {
                let Some(iface) = self.interfaces.get_mut(&if_name)
                else {
                    return;
                };
                iface.addrs.remove(&addr);
                self.sync_spark().await;
                self.redistribute_prefixes().await;
            }
        }
    }

    async fn process_timer(&mut self, timer: TimerMsg) {
        match timer {
            TimerMsg::FlapEnd { if_name } => {
                let Some(iface) = self.interfaces.get_mut(&if_name)
                else {
                    return;
                };
                iface.dampened = false;
                iface.flap_timer = None;
                if iface.up {
                    debug!(interface = %if_name, "dampening lifted");
                    let stable_timer = stable_timer(
                        &self.timer_tx,
                        &if_name,
                        self.config.flap_max_backoff,
                    );
                    self.interfaces
                        .get_mut(&if_name)
                        .unwrap()
                        .stable_timer = Some(stable_timer);
                    self.sync_spark().await;
                    self.schedule_advertisement();
                }
            }
            TimerMsg::StableEnd { if_name } => {
                let Some(iface) = self.interfaces.get_mut(&if_name)
                else {
                    return;
                };
                iface.stable_timer = None;
                if iface.up && !iface.dampened {
                    // The link survived a full window; forgive its
                    // history.
                    iface.backoff.report_success();
                }
            }
        }
    }

    // Returns whether the interface passes the include/exclude
    // filters.
    fn interface_admitted(&self, if_name: &str) -> bool {
        if self.exclude.is_match(if_name) {
            return false;
        }
        self.include.is_empty() || self.include.is_match(if_name)
    }

    // Pushes the active interface set down to spark.
    async fn sync_spark(&mut self) {
        let interfaces = self
            .interfaces
            .iter()
            .filter(|(_, iface)| iface.up && !iface.dampened)
            .map(|(if_name, iface)| InterfaceInfo {
                if_name: if_name.clone(),
                ifindex: iface.ifindex,
                v6_addr: iface
                    .addrs
                    .iter()
                    .find_map(|addr| match addr {
                        IpNetwork::V6(network)
                            if is_link_local(&network.ip()) =>
                        {
                            Some(network.ip())
                        }
                        _ => None,
                    })
                    .unwrap_or(std::net::Ipv6Addr::UNSPECIFIED),
                v4_network: iface.addrs.iter().find_map(|addr| {
                    match addr {
                        IpNetwork::V4(network) => Some(*network),
                        IpNetwork::V6(_) => None,
                    }
                }),
            })
            .collect();
        if let Err(error) = self.spark.update_interfaces(interfaces).await
        {
            warn!(%error, "failed to sync interfaces to spark");
        }
    }

    // Re-advertises the global prefixes of redistributed interfaces.
    async fn redistribute_prefixes(&mut self) {
        if self.redistribute.is_empty() {
            return;
        }
        let entries = self
            .interfaces
            .iter()
            .filter(|(if_name, iface)| {
                iface.up
                    && !iface.dampened
                    && self.redistribute.is_match(if_name)
            })
            .flat_map(|(_, iface)| iface.addrs.iter())
            .filter(|addr| match addr {
                IpNetwork::V4(_) => true,
                IpNetwork::V6(network) => !is_link_local(&network.ip()),
            })
            .map(|addr| PrefixEntry {
                prefix: *addr,
                prefix_type: PrefixType::Loopback,
                data: Bytes::new(),
                forwarding_type: ForwardingType::Ip,
                forwarding_algorithm: ForwardingAlgorithm::SpEcmp,
                ephemeral: true,
                metric_vector: None,
            })
            .collect::<Vec<_>>();

        if let Err(error) = self
            .prefix_manager
            .sync_prefixes_by_type(PrefixType::Loopback, entries)
            .await
        {
            warn!(%error, "failed to redistribute interface prefixes");
        }
    }

    fn schedule_advertisement(&mut self) {
        self.pending_since.get_or_insert_with(Instant::now);
    }

    // Originates the adjacency database of every area into the
    // KvStore.
    async fn advertise_adjacencies(&mut self) {
        for area in self.config.areas.clone() {
            let adjacencies = self
                .adjacencies
                .values()
                .filter(|entry| entry.info.area == area)
                .filter(|entry| {
                    self.interfaces
                        .get(&entry.info.if_name)
                        .map(|iface| iface.up && !iface.dampened)
                        .unwrap_or(false)
                })
                .map(|entry| self.build_adjacency(entry))
                .collect::<Vec<_>>();

            let db = AdjacencyDatabase {
                this_node_name: self.config.node_name.clone(),
                is_overloaded: self.overrides.node_overloaded,
                node_label: self.config.node_label,
                adjacencies,
            };
            let key = adj_key(&self.config.node_name, &area);
            self.publish(&area, key, &db).await;
        }
    }

    fn build_adjacency(&self, entry: &AdjEntry) -> Adjacency {
        let info = &entry.info;
        let metric = self
            .overrides
            .adjacency_metrics
            .get(&(info.if_name.clone(), info.node_name.clone()))
            .or_else(|| {
                self.overrides.interface_metrics.get(&info.if_name)
            })
            .copied()
            .unwrap_or(DEFAULT_METRIC);

        Adjacency {
            other_node_name: info.node_name.clone(),
            other_if_name: info.remote_if_name.clone(),
            if_name: info.if_name.clone(),
            metric,
            adj_label: info.label,
            is_overloaded: self
                .overrides
                .interface_overloads
                .contains(&info.if_name),
            rtt_us: info.rtt_us,
            timestamp: entry.since_unix,
            weight: 1,
            v4_addr: info.v4_addr.map(IpAddr::V4),
            v6_addr: Some(IpAddr::V6(info.v6_addr)),
        }
    }

    async fn publish(
        &self,
        area: &Area,
        key: String,
        db: &AdjacencyDatabase,
    ) {
        let payload = match bincode::serde::encode_to_vec(
            db,
            bincode::config::standard(),
        ) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode adjacency database");
                return;
            }
        };

        let current = self
            .kvstore
            .get_keys(area.clone(), vec![key.clone()])
            .await
            .ok()
            .and_then(|found| found.get(&key).map(|value| value.version))
            .unwrap_or(0);

        let value = Value::new(
            current + 1,
            self.config.node_name.clone(),
            Bytes::from(payload),
            self.config.adj_ttl_ms,
        );
        let params = KeySetParams {
            key_vals: BTreeMap::from([(key.clone(), value)]),
            refresh_ttl: true,
            ..Default::default()
        };
        if let Err(error) =
            self.kvstore.set_keys(area.clone(), params).await
        {
            warn!(%key, %error, "failed to originate adjacency database");
        }
    }
}

// ===== impl LinkMonitorHandle =====

impl LinkMonitorHandle {
    pub async fn set_node_overload(&self) -> Result<(), Error> {
        self.request(|responder| Command::SetNodeOverload {
            value: true,
            responder,
        })
        .await?
    }

    pub async fn unset_node_overload(&self) -> Result<(), Error> {
        self.request(|responder| Command::SetNodeOverload {
            value: false,
            responder,
        })
        .await?
    }

    pub async fn set_interface_overload(
        &self,
        if_name: String,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SetInterfaceOverload {
            if_name,
            value: true,
            responder,
        })
        .await?
    }

    pub async fn unset_interface_overload(
        &self,
        if_name: String,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SetInterfaceOverload {
            if_name,
            value: false,
            responder,
        })
        .await?
    }

    pub async fn set_interface_metric(
        &self,
        if_name: String,
        metric: u32,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SetInterfaceMetric {
            if_name,
            metric: Some(metric),
            responder,
        })
        .await?
    }

    pub async fn unset_interface_metric(
        &self,
        if_name: String,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SetInterfaceMetric {
            if_name,
            metric: None,
            responder,
        })
        .await?
    }

    pub async fn set_adjacency_metric(
        &self,
        if_name: String,
        adj_node: String,
        metric: u32,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SetAdjacencyMetric {
            if_name,
            adj_node,
            metric: Some(metric),
            responder,
        })
        .await?
    }

    pub async fn unset_adjacency_metric(
        &self,
        if_name: String,
        adj_node: String,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SetAdjacencyMetric {
            if_name,
            adj_node,
            metric: None,
            responder,
        })
        .await?
    }

    pub async fn get_interfaces(
        &self,
    ) -> Result<Vec<InterfaceDetails>, Error> {
        self.request(|responder| Command::GetInterfaces { responder })
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

// Link monitor errors.
#[derive(Debug)]
pub enum Error {
    InterfaceNotFound(String),
    InvalidRegex(regex::Error),
    TaskShutDown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InterfaceNotFound(if_name) => {
                write!(f, "interface not found: {}", if_name)
            }
            Error::InvalidRegex(..) => {
                write!(f, "invalid interface filter")
            }
            Error::TaskShutDown => {
                write!(f, "link monitor task is not running")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidRegex(error) => Some(error),
            _ => None,
        }
    }
}

// ===== helper functions =====

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

fn is_link_local(addr: &std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn flap_timer(
    timer_tx: &Sender<TimerMsg>,
    if_name: &str,
    remaining: Duration,
) -> TimeoutTask {
    let timer_tx = timer_tx.clone();
    let if_name = if_name.to_owned();
    TimeoutTask::new(remaining, move || async move {
        let _ = timer_tx.send(TimerMsg::FlapEnd { if_name }).await;
    })
}

fn stable_timer(
    timer_tx: &Sender<TimerMsg>,
    if_name: &str,
    window: Duration,
) -> TimeoutTask {
    let timer_tx = timer_tx.clone();
    let if_name = if_name.to_owned();
    TimeoutTask::new(window, move || async move {
        let _ = timer_tx.send(TimerMsg::StableEnd { if_name }).await;
    })
}
