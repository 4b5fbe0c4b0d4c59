//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod error;
pub mod neighbor;
pub mod packet;

mod network;

pub use error::Error;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::Ipv4Network;
use lattice_utils::mpls::{Label, LabelRange};
use lattice_utils::task::{IntervalTask, Task, TimeoutTask};
use lattice_utils::timeseries::BucketedTimeSeries;
use lattice_utils::Area;
use rand::Rng;
use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, Instrument};

use crate::error::RejectReason;
use crate::neighbor::{
    compute_rtt_us, fsm_transition, LabelAllocator, Neighbor,
    NeighborEvent, NeighborState,
};
use crate::network::{now_us, RxPacket};
use crate::packet::{
    HandshakeMsg, HeartbeatMsg, HelloMsg, ReflectedNeighborInfo, SparkMsg,
    LOWEST_SUPPORTED_VERSION, VERSION,
};

// Number of goodbye hellos sent per interface on graceful shutdown.
const GR_SHUTDOWN_HELLO_COUNT: usize = 3;

// Rate-limit accounting window.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);
const RATE_LIMIT_BUCKETS: usize = 10;

/// Spark configuration.
#[derive(Clone, Debug)]
pub struct SparkConfig {
    pub node_name: String,
    pub domain: String,
    pub areas: Vec<Area>,
    // Link-local discovery group and port.
    pub mcast_group: Ipv6Addr,
    pub udp_port: u16,
    // Steady and fast-discovery hello cadences.
    pub keep_alive_time: Duration,
    pub fast_init_keep_alive_time: Duration,
    pub handshake_time: Duration,
    // Local floor for negotiated timers. Must be at least three times
    // the keep-alive interval.
    pub hold_time: Duration,
    pub graceful_restart_time: Duration,
    // Adjacency label allocation range.
    pub sr_label_range: LabelRange,
    pub v4_enabled: bool,
    pub v4_subnet_validation: bool,
    // Per-(interface, source) inbound packet budget.
    pub max_packets_per_sec: u64,
    pub flood_opt_support: bool,
    // Ports advertised in handshakes.
    pub ctrl_port: u16,
    pub kv_port: u16,
}

/// One interface spark should discover neighbors on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterfaceInfo {
    pub if_name: String,
    pub ifindex: u32,
    pub v6_addr: Ipv6Addr,
    pub v4_network: Option<Ipv4Network>,
}

/// Neighbor lifecycle events emitted to the link monitor.
#[derive(Clone, Debug)]
pub enum NeighborUpdate {
    Up(NeighborInfo),
    Down {
        node_name: String,
        if_name: String,
    },
    Restarting {
        node_name: String,
        if_name: String,
    },
    Restarted(NeighborInfo),
    RttChange {
        node_name: String,
        if_name: String,
        rtt_us: u64,
    },
}

/// Everything the link monitor needs to build an adjacency.
#[derive(Clone, Debug)]
pub struct NeighborInfo {
    pub node_name: String,
    pub if_name: String,
    pub remote_if_name: String,
    pub area: Area,
    pub v4_addr: Option<Ipv4Addr>,
    pub v6_addr: Ipv6Addr,
    pub label: Label,
    pub rtt_us: Option<u64>,
    pub hold_time: Duration,
    pub ctrl_port: u16,
    pub kv_port: u16,
}

/// Introspection snapshot of one tracked neighbor.
#[derive(Clone, Debug)]
pub struct NeighborDump {
    pub node_name: String,
    pub if_name: String,
    pub remote_if_name: String,
    pub state: NeighborState,
    pub area: Option<String>,
    pub rtt_us: Option<u64>,
}

/// Packet and drop counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SparkCounters {
    pub hellos_rx: u64,
    pub hellos_tx: u64,
    pub handshakes_rx: u64,
    pub handshakes_tx: u64,
    pub heartbeats_rx: u64,
    pub heartbeats_tx: u64,
    pub decode_failures: u64,
    pub rejects: u64,
}

// Requests accepted by the spark task.
#[derive(Debug)]
enum Command {
    UpdateInterfaces {
        interfaces: Vec<InterfaceInfo>,
        responder: oneshot::Sender<()>,
    },
    GetNeighbors {
        responder: oneshot::Sender<Vec<NeighborDump>>,
    },
    GetCounters {
        responder: oneshot::Sender<SparkCounters>,
    },
    GracefulShutdown {
        responder: oneshot::Sender<()>,
    },
}

// Timer expirations and ticks, delivered from timer tasks.
#[derive(Debug)]
enum TimerMsg {
    HelloTick { if_name: String },
    FastInitEnd { if_name: String },
    HeartbeatTick { if_name: String },
    HandshakeTick { if_name: String, node_name: String },
    HoldExpired { if_name: String, node_name: String },
    NegotiateExpired { if_name: String, node_name: String },
    GrExpired { if_name: String, node_name: String },
}

/// Client handle to a running spark task.
#[derive(Clone, Debug)]
pub struct SparkHandle {
    cmd_tx: Sender<Command>,
}

// Per-interface discovery state.
struct SparkInterface {
    info: InterfaceInfo,
    socket: Arc<AsyncFd<Socket>>,
    fast_init: bool,
    hello_interval: IntervalTask,
    _fast_init_end: Option<TimeoutTask>,
    _heartbeat_interval: IntervalTask,
    _rx_task: Task<()>,
    // Inbound packet budget per source address.
    rate_limits: HashMap<Ipv6Addr, BucketedTimeSeries>,
}

/// Per-interface neighbor discovery and liveness.
///
/// Owns the multicast sockets and all neighbor state; communicates
/// through channels only.
pub struct Spark {
    config: SparkConfig,
    interfaces: BTreeMap<String, SparkInterface>,
    // Tracked neighbors, keyed by (interface, node name).
    neighbors: BTreeMap<(String, String), Neighbor>,
    allocator: LabelAllocator,
    // Our hello and heartbeat sequence numbers.
    seq_num: u64,
    heartbeat_seq: u64,
    counters: SparkCounters,
    cmd_rx: Receiver<Command>,
    pkt_rx: Receiver<RxPacket>,
    pkt_tx: Sender<RxPacket>,
    timer_rx: Receiver<TimerMsg>,
    timer_tx: Sender<TimerMsg>,
    events_tx: Sender<NeighborUpdate>,
}

// ===== impl Spark =====

impl Spark {
    /// Spawns the spark task. Returns the handle, the neighbor event
    /// stream and the task.
    pub fn spawn(
        config: SparkConfig,
    ) -> (SparkHandle, Receiver<NeighborUpdate>, Task<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (pkt_tx, pkt_rx) = mpsc::channel(256);
        let (timer_tx, timer_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);

        let spark = Spark {
            allocator: LabelAllocator::new(config.sr_label_range),
            config,
            interfaces: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            seq_num: 0,
            heartbeat_seq: 0,
            counters: SparkCounters::default(),
            cmd_rx,
            pkt_rx,
            pkt_tx,
            timer_rx,
            timer_tx,
            events_tx,
        };
        let task =
            Task::spawn(spark.run().instrument(debug_span!("spark")));

        (SparkHandle { cmd_tx }, events_rx, task)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.process_command(cmd).await;
                }
                Some(packet) = self.pkt_rx.recv() => {
                    self.process_packet(packet).await;
                }
                Some(timer) = self.timer_rx.recv() => {
                    self.process_timer(timer).await;
                }
            }
        }
    }

    async fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::UpdateInterfaces {
                interfaces,
                responder,
            } => {
                self.update_interfaces(interfaces).await;
                let _ = responder.send(());
            }
            Command::GetNeighbors { responder } => {
                let dump = self
                    .neighbors
                    .values()
                    .map(|nbr| NeighborDump {
                        node_name: nbr.node_name.clone(),
                        if_name: nbr.if_name.clone(),
                        remote_if_name: nbr.remote_if_name.clone(),
                        state: nbr.state,
                        area: nbr.area.clone(),
                        rtt_us: nbr.rtt_latest_us,
                    })
                    .collect();
                let _ = responder.send(dump);
            }
            Command::GetCounters { responder } => {
                let _ = responder.send(self.counters);
            }
            Command::GracefulShutdown { responder } => {
                // Tell every neighbor we're going away before the
                // process exits.
                let if_names =
                    self.interfaces.keys().cloned().collect::<Vec<_>>();
                for if_name in if_names {
                    for _ in 0..GR_SHUTDOWN_HELLO_COUNT {
                        self.send_hello(&if_name, false, true).await;
                    }
                }
                let _ = responder.send(());
            }
        }
    }

    // ===== interface management =====

    async fn update_interfaces(&mut self, interfaces: Vec<InterfaceInfo>) {
        let new_names = interfaces
            .iter()
            .map(|info| info.if_name.clone())
            .collect::<BTreeSet<_>>();

        let removed = self
            .interfaces
            .keys()
            .filter(|name| !new_names.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        for if_name in removed {
            self.remove_interface(&if_name).await;
        }

        for info in interfaces {
            let unchanged = self
                .interfaces
                .get(&info.if_name)
                .map(|iface| iface.info == info)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            if self.interfaces.contains_key(&info.if_name) {
                self.remove_interface(&info.if_name).await;
            }
            self.add_interface(info);
        }
    }

    fn add_interface(&mut self, info: InterfaceInfo) {
        debug!(interface = %info.if_name, "tracking interface");

        let socket = match network::mcast_socket(
            info.ifindex,
            &self.config.mcast_group,
            self.config.udp_port,
        ) {
            Ok(socket) => Arc::new(socket),
            Err(error) => {
                Error::from(error).log();
                return;
            }
        };

        // Fast discovery cadence first, steady keep-alive after.
        let hello_interval = self.hello_interval_task(
            &info.if_name,
            jittered(self.config.fast_init_keep_alive_time),
        );
        let fast_init_end = self.fast_init_end_task(&info.if_name);
        let heartbeat_interval = self.heartbeat_interval_task(
            &info.if_name,
            self.config.keep_alive_time / 3,
        );
        let rx_task = network::rx_task(
            info.if_name.clone(),
            socket.clone(),
            self.pkt_tx.clone(),
        );

        self.interfaces.insert(
            info.if_name.clone(),
            SparkInterface {
                info,
                socket,
                fast_init: true,
                hello_interval,
                _fast_init_end: Some(fast_init_end),
                _heartbeat_interval: heartbeat_interval,
                _rx_task: rx_task,
                rate_limits: HashMap::new(),
            },
        );
    }

    async fn remove_interface(&mut self, if_name: &str) {
        debug!(interface = %if_name, "untracking interface");

        let keys = self
            .neighbors
            .keys()
            .filter(|(iface, _)| iface == if_name)
            .cloned()
            .collect::<Vec<_>>();
        for key in keys {
            let neighbor = self.neighbors.get(&key).unwrap();
            if matches!(
                neighbor.state,
                NeighborState::Established | NeighborState::Restart
            ) {
                self.neighbor_down(&key).await;
            }
            self.neighbors.remove(&key);
        }
        self.interfaces.remove(if_name);
    }

    // ===== packet input =====

    async fn process_packet(&mut self, packet: RxPacket) {
        let Some(iface) = self.interfaces.get_mut(&packet.if_name) else {
            return;
        };

        // Anti-spoof: anything that crossed a router is rejected.
        if let Some(hop_limit) = packet.hop_limit {
            if hop_limit
                < lattice_utils::socket::CTRL_HOP_LIMIT
            {
                self.counters.rejects += 1;
                Error::PacketReject(
                    packet.if_name,
                    RejectReason::HopLimit(hop_limit),
                )
                .log();
                return;
            }
        }

        // Per-source rate limit.
        let now = Instant::now();
        let series = iface
            .rate_limits
            .entry(packet.src)
            .or_insert_with(|| {
                BucketedTimeSeries::new(
                    RATE_LIMIT_WINDOW,
                    RATE_LIMIT_BUCKETS,
                )
            });
        series.add_value(now);
        if series.count(now) > self.config.max_packets_per_sec {
            self.counters.rejects += 1;
            Error::PacketReject(packet.if_name, RejectReason::RateLimited)
                .log();
            return;
        }

        let msg = match packet.msg {
            Ok(msg) => msg,
            Err(error) => {
                self.counters.decode_failures += 1;
                Error::PacketDecode(packet.if_name, error).log();
                return;
            }
        };

        // Our own multicast looped back.
        if msg.node_name() == self.config.node_name {
            return;
        }

        match msg {
            SparkMsg::Hello(hello) => {
                self.counters.hellos_rx += 1;
                self.process_hello(
                    packet.if_name,
                    hello,
                    packet.rcvd_ts_us,
                )
                .await;
            }
            SparkMsg::Handshake(handshake) => {
                self.counters.handshakes_rx += 1;
                self.process_handshake(packet.if_name, handshake).await;
            }
            SparkMsg::Heartbeat(heartbeat) => {
                self.counters.heartbeats_rx += 1;
                self.process_heartbeat(packet.if_name, heartbeat);
            }
        }
    }

    async fn process_hello(
        &mut self,
        if_name: String,
        hello: HelloMsg,
        rcvd_ts_us: u64,
    ) {
        // Validation.
        if hello.domain != self.config.domain {
            self.counters.rejects += 1;
            Error::PacketReject(
                if_name,
                RejectReason::DomainMismatch(hello.domain),
            )
            .log();
            return;
        }
        if hello.version < LOWEST_SUPPORTED_VERSION {
            self.counters.rejects += 1;
            Error::PacketReject(
                if_name,
                RejectReason::VersionTooOld(hello.version),
            )
            .log();
            return;
        }

        let key = (if_name.clone(), hello.node_name.clone());
        if !self.neighbors.contains_key(&key) {
            debug!(
                interface = %if_name,
                neighbor = %hello.node_name,
                "neighbor discovered"
            );
            self.neighbors.insert(
                key.clone(),
                Neighbor::new(
                    hello.node_name.clone(),
                    hello.domain.clone(),
                    if_name.clone(),
                    hello.if_name.clone(),
                ),
            );
        }

        let reflected_me =
            hello.neighbor_infos.get(&self.config.node_name).copied();
        let mut rtt_event = None;
        let established;
        {
            let neighbor = self.neighbors.get_mut(&key).unwrap();

            // Record the reflection data for our next hello.
            neighbor.seq_num = hello.seq_num;
            neighbor.remote_if_name = hello.if_name.clone();
            neighbor.advertised_areas = hello.areas.clone();
            neighbor.reflected = ReflectedNeighborInfo {
                seq_num: hello.seq_num,
                last_nbr_msg_sent_ts_us: hello.sent_ts_us,
                last_my_msg_rcvd_ts_us: rcvd_ts_us,
            };

            // RTT from the reflected timestamps, once the neighbor sees
            // us.
            if let Some(info) = reflected_me {
                if info.last_nbr_msg_sent_ts_us != 0 {
                    let rtt = compute_rtt_us(
                        info.last_nbr_msg_sent_ts_us,
                        info.last_my_msg_rcvd_ts_us,
                        hello.sent_ts_us,
                        rcvd_ts_us,
                    );
                    if let Some(rtt_us) = rtt {
                        if let Some(level) = neighbor.track_rtt(rtt_us) {
                            if neighbor.state
                                == NeighborState::Established
                            {
                                rtt_event = Some(level);
                            }
                        }
                    }
                }
            }
            established =
                neighbor.state == NeighborState::Established;
        }
        if let Some(rtt_us) = rtt_event {
            self.emit(NeighborUpdate::RttChange {
                node_name: key.1.clone(),
                if_name: key.0.clone(),
                rtt_us,
            })
            .await;
        }

        // Graceful restart announcement.
        if hello.restarting {
            if established {
                self.transition(&key, NeighborEvent::HelloRcvdRestart)
                    .await;
            }
            return;
        }

        let event = if reflected_me.is_some() {
            NeighborEvent::HelloRcvdInfo
        } else {
            NeighborEvent::HelloRcvdNoInfo
        };
        self.transition(&key, event).await;

        // Any hello proves liveness.
        self.refresh_hold_timer(&key);

        if hello.solicit_response {
            self.send_hello(&if_name, false, false).await;
        }
    }

    async fn process_handshake(
        &mut self,
        if_name: String,
        handshake: HandshakeMsg,
    ) {
        let key = (if_name.clone(), handshake.node_name.clone());
        let Some(neighbor) = self.neighbors.get_mut(&key) else {
            return;
        };
        if neighbor.state != NeighborState::Negotiate {
            return;
        }

        // The handshake must be for the area both sides agreed on.
        if neighbor.area.as_deref() != Some(handshake.area.as_str()) {
            self.counters.rejects += 1;
            Error::PacketReject(if_name, RejectReason::NoCommonArea).log();
            return;
        }

        // IPv4 subnet validation.
        if self.config.v4_enabled && self.config.v4_subnet_validation {
            let v4_network = self
                .interfaces
                .get(&if_name)
                .and_then(|iface| iface.info.v4_network);
            match (handshake.v4_addr, v4_network) {
                (None, _) => {
                    self.counters.rejects += 1;
                    Error::PacketReject(
                        if_name,
                        RejectReason::MissingV4Addr,
                    )
                    .log();
                    return;
                }
                (Some(addr), Some(network))
                    if !network.contains(addr) =>
                {
                    self.counters.rejects += 1;
                    Error::PacketReject(
                        if_name,
                        RejectReason::V4SubnetMismatch,
                    )
                    .log();
                    return;
                }
                _ => (),
            }
        }

        // Negotiate timers: the slower side wins, floored locally.
        let neighbor = self.neighbors.get_mut(&key).unwrap();
        neighbor.hold_time = self
            .config
            .hold_time
            .max(Duration::from_millis(handshake.hold_time_ms));
        neighbor.graceful_restart_time =
            self.config.graceful_restart_time.max(Duration::from_millis(
                handshake.graceful_restart_time_ms,
            ));
        neighbor.v4_addr = handshake.v4_addr;
        neighbor.v6_addr = Some(handshake.v6_addr);
        neighbor.ctrl_port = handshake.ctrl_port;
        neighbor.kv_port = handshake.kv_port;

        // Assign the adjacency label.
        if neighbor.label.is_none() {
            let ifindex = self
                .interfaces
                .get(&if_name)
                .map(|iface| iface.info.ifindex)
                .unwrap_or(0);
            match self.allocator.allocate(ifindex) {
                Some(label) => {
                    self.neighbors.get_mut(&key).unwrap().label =
                        Some(label)
                }
                None => {
                    Error::LabelExhausted(if_name).log();
                    return;
                }
            }
        }

        self.transition(&key, NeighborEvent::HandshakeRcvd).await;

        // Confirm establishment so the neighbor can stop handshaking.
        self.send_handshake(&key, true).await;
    }

    fn process_heartbeat(
        &mut self,
        if_name: String,
        heartbeat: HeartbeatMsg,
    ) {
        let key = (if_name, heartbeat.node_name);
        let Some(neighbor) = self.neighbors.get(&key) else {
            return;
        };
        // Heartbeats only matter on an established adjacency.
        if neighbor.state == NeighborState::Established {
            self.refresh_hold_timer(&key);
        }
    }

    // ===== state transitions =====

    async fn transition(
        &mut self,
        key: &(String, String),
        event: NeighborEvent,
    ) {
        let neighbor = self.neighbors.get_mut(key).unwrap();
        let old_state = neighbor.state;
        let Some(new_state) = fsm_transition(old_state, event) else {
            return;
        };
        if new_state == old_state {
            return;
        }

        debug!(
            interface = %key.0,
            neighbor = %key.1,
            ?old_state,
            ?new_state,
            ?event,
            "neighbor state change"
        );
        neighbor.state = new_state;

        match (old_state, new_state) {
            (NeighborState::Warm, NeighborState::Negotiate) => {
                // Exactly one common area is required to proceed.
                match self.negotiate_area(key) {
                    Ok(()) => {
                        self.start_negotiation(key).await;
                    }
                    Err(reason) => {
                        self.counters.rejects += 1;
                        Error::PacketReject(key.0.clone(), reason).log();
                        let neighbor =
                            self.neighbors.get_mut(key).unwrap();
                        neighbor.state = NeighborState::Warm;
                    }
                }
            }
            (NeighborState::Negotiate, NeighborState::Established) => {
                let neighbor = self.neighbors.get_mut(key).unwrap();
                neighbor.negotiate_timer = None;
                neighbor.handshake_interval = None;
                self.refresh_hold_timer(key);
                if let Some(info) = self.neighbor_info(key) {
                    self.emit(NeighborUpdate::Up(info)).await;
                }
            }
            (NeighborState::Negotiate, NeighborState::Warm) => {
                let neighbor = self.neighbors.get_mut(key).unwrap();
                neighbor.negotiate_timer = None;
                neighbor.handshake_interval = None;
            }
            (NeighborState::Established, NeighborState::Restart) => {
                // Keep forwarding state while the neighbor restarts.
                let gr_time = self
                    .neighbors
                    .get(key)
                    .map(|neighbor| neighbor.graceful_restart_time)
                    .unwrap_or(self.config.graceful_restart_time);
                let gr_timer = self.gr_timer_task(key, gr_time);
                let neighbor = self.neighbors.get_mut(key).unwrap();
                neighbor.hold_timer = None;
                neighbor.gr_timer = Some(gr_timer);
                self.emit(NeighborUpdate::Restarting {
                    node_name: key.1.clone(),
                    if_name: key.0.clone(),
                })
                .await;
            }
            (NeighborState::Restart, NeighborState::Established) => {
                let neighbor = self.neighbors.get_mut(key).unwrap();
                neighbor.gr_timer = None;
                self.refresh_hold_timer(key);
                if let Some(info) = self.neighbor_info(key) {
                    self.emit(NeighborUpdate::Restarted(info)).await;
                }
            }
            (
                NeighborState::Established | NeighborState::Restart,
                NeighborState::Idle,
            ) => {
                self.neighbor_down(key).await;
            }
            _ => (),
        }
    }

    fn negotiate_area(
        &mut self,
        key: &(String, String),
    ) -> Result<(), RejectReason> {
        let config_areas = self.config.areas.clone();
        let neighbor = self.neighbors.get_mut(key).unwrap();
        if neighbor.area.is_some() {
            return Ok(());
        }

        let common = config_areas
            .iter()
            .filter(|area| neighbor.advertised_areas.contains(&area.0))
            .collect::<Vec<_>>();
        match common.as_slice() {
            [] => Err(RejectReason::NoCommonArea),
            [area] => {
                neighbor.area = Some(area.0.clone());
                Ok(())
            }
            _ => Err(RejectReason::MultipleCommonAreas),
        }
    }

    async fn start_negotiation(&mut self, key: &(String, String)) {
        let negotiate_timer = self.negotiate_timer_task(key);
        let handshake_interval = self.handshake_interval_task(key);
        let neighbor = self.neighbors.get_mut(key).unwrap();
        neighbor.negotiate_timer = Some(negotiate_timer);
        neighbor.handshake_interval = Some(handshake_interval);
        self.send_handshake(key, false).await;
    }

    async fn neighbor_down(&mut self, key: &(String, String)) {
        let label = {
            let neighbor = self.neighbors.get_mut(key).unwrap();
            neighbor.stop_timers();
            neighbor.state = NeighborState::Idle;
            neighbor.area = None;
            neighbor.label.take()
        };
        if let Some(label) = label {
            self.allocator.release(label);
        }
        self.emit(NeighborUpdate::Down {
            node_name: key.1.clone(),
            if_name: key.0.clone(),
        })
        .await;
    }

    fn neighbor_info(&self, key: &(String, String)) -> Option<NeighborInfo> {
        let neighbor = self.neighbors.get(key)?;
        Some(NeighborInfo {
            node_name: neighbor.node_name.clone(),
            if_name: neighbor.if_name.clone(),
            remote_if_name: neighbor.remote_if_name.clone(),
            area: Area(neighbor.area.clone()?),
            v4_addr: neighbor.v4_addr,
            v6_addr: neighbor.v6_addr?,
            label: neighbor.label?,
            rtt_us: neighbor.rtt_latest_us,
            hold_time: neighbor.hold_time,
            ctrl_port: neighbor.ctrl_port,
            kv_port: neighbor.kv_port,
        })
    }

    // ===== timers =====

    async fn process_timer(&mut self, timer: TimerMsg) {
        match timer {
            TimerMsg::HelloTick { if_name } => {
                let solicit = self
                    .interfaces
                    .get(&if_name)
                    .map(|iface| iface.fast_init)
                    .unwrap_or(false);
                self.send_hello(&if_name, solicit, false).await;
            }
            TimerMsg::FastInitEnd { if_name } => {
                let keep_alive = self.config.keep_alive_time;
                if let Some(iface) = self.interfaces.get_mut(&if_name) {
                    iface.fast_init = false;
                    iface.hello_interval.reset(Some(keep_alive));
                }
            }
            TimerMsg::HeartbeatTick { if_name } => {
                self.send_heartbeat(&if_name).await;
            }
            TimerMsg::HandshakeTick { if_name, node_name } => {
                let key = (if_name, node_name);
                let negotiating = self
                    .neighbors
                    .get(&key)
                    .map(|neighbor| {
                        neighbor.state == NeighborState::Negotiate
                    })
                    .unwrap_or(false);
                if negotiating {
                    self.send_handshake(&key, false).await;
                }
            }
            TimerMsg::HoldExpired { if_name, node_name } => {
                let key = (if_name, node_name);
                let Some(neighbor) = self.neighbors.get(&key) else {
                    return;
                };
                match neighbor.state {
                    NeighborState::Established => {
                        self.transition(
                            &key,
                            NeighborEvent::HeartbeatTimerExpire,
                        )
                        .await;
                    }
                    NeighborState::Restart => (),
                    _ => {
                        // A quiet neighbor that never got established is
                        // simply forgotten.
                        self.neighbors.remove(&key);
                    }
                }
            }
            TimerMsg::NegotiateExpired { if_name, node_name } => {
                let key = (if_name, node_name);
                if self.neighbors.contains_key(&key) {
                    self.transition(
                        &key,
                        NeighborEvent::NegotiateTimerExpire,
                    )
                    .await;
                }
            }
            TimerMsg::GrExpired { if_name, node_name } => {
                let key = (if_name, node_name);
                if self.neighbors.contains_key(&key) {
                    self.transition(&key, NeighborEvent::GrTimerExpire)
                        .await;
                }
            }
        }
    }

    fn refresh_hold_timer(&mut self, key: &(String, String)) {
        let neighbor = self.neighbors.get(key).unwrap();
        let hold_time = if neighbor.hold_time.is_zero() {
            self.config.hold_time
        } else {
            neighbor.hold_time
        };

        if neighbor.hold_timer.is_some() {
            let neighbor = self.neighbors.get_mut(key).unwrap();
            neighbor.hold_timer.as_mut().unwrap().reset(Some(hold_time));
        } else {
            let timer = self.hold_timer_task(key, hold_time);
            let neighbor = self.neighbors.get_mut(key).unwrap();
            neighbor.hold_timer = Some(timer);
        }
    }

    fn hello_interval_task(
        &self,
        if_name: &str,
        period: Duration,
    ) -> IntervalTask {
        let timer_tx = self.timer_tx.clone();
        let if_name = if_name.to_owned();
        IntervalTask::new(period, true, move || {
            let timer_tx = timer_tx.clone();
            let if_name = if_name.clone();
            async move {
                let _ =
                    timer_tx.send(TimerMsg::HelloTick { if_name }).await;
            }
        })
    }

    fn fast_init_end_task(&self, if_name: &str) -> TimeoutTask {
        let timer_tx = self.timer_tx.clone();
        let if_name = if_name.to_owned();
        TimeoutTask::new(self.config.keep_alive_time * 3, move || {
            async move {
                let _ = timer_tx
                    .send(TimerMsg::FastInitEnd { if_name })
                    .await;
            }
        })
    }

    fn heartbeat_interval_task(
        &self,
        if_name: &str,
        period: Duration,
    ) -> IntervalTask {
        let timer_tx = self.timer_tx.clone();
        let if_name = if_name.to_owned();
        IntervalTask::new(period, false, move || {
            let timer_tx = timer_tx.clone();
            let if_name = if_name.clone();
            async move {
                let _ = timer_tx
                    .send(TimerMsg::HeartbeatTick { if_name })
                    .await;
            }
        })
    }

    fn handshake_interval_task(
        &self,
        key: &(String, String),
    ) -> IntervalTask {
        let timer_tx = self.timer_tx.clone();
        let (if_name, node_name) = key.clone();
        IntervalTask::new(self.config.handshake_time, false, move || {
            let timer_tx = timer_tx.clone();
            let if_name = if_name.clone();
            let node_name = node_name.clone();
            async move {
                let _ = timer_tx
                    .send(TimerMsg::HandshakeTick { if_name, node_name })
                    .await;
            }
        })
    }

    fn negotiate_timer_task(&self, key: &(String, String)) -> TimeoutTask {
        let timer_tx = self.timer_tx.clone();
        let (if_name, node_name) = key.clone();
        TimeoutTask::new(self.config.hold_time, move || async move {
            let _ = timer_tx
                .send(TimerMsg::NegotiateExpired { if_name, node_name })
                .await;
        })
    }

    fn hold_timer_task(
        &self,
        key: &(String, String),
        hold_time: Duration,
    ) -> TimeoutTask {
        let timer_tx = self.timer_tx.clone();
        let (if_name, node_name) = key.clone();
        TimeoutTask::new(hold_time, move || async move {
            let _ = timer_tx
                .send(TimerMsg::HoldExpired { if_name, node_name })
                .await;
        })
    }

    fn gr_timer_task(
        &self,
        key: &(String, String),
        gr_time: Duration,
    ) -> TimeoutTask {
        let timer_tx = self.timer_tx.clone();
        let (if_name, node_name) = key.clone();
        TimeoutTask::new(gr_time, move || async move {
            let _ = timer_tx
                .send(TimerMsg::GrExpired { if_name, node_name })
                .await;
        })
    }

    // ===== packet output =====

    async fn send_hello(
        &mut self,
        if_name: &str,
        solicit_response: bool,
        restarting: bool,
    ) {
        let Some(iface) = self.interfaces.get(if_name) else {
            return;
        };
        self.seq_num += 1;

        let neighbor_infos = self
            .neighbors
            .iter()
            .filter(|((iface_name, _), _)| iface_name == if_name)
            .map(|((_, node_name), neighbor)| {
                (node_name.clone(), neighbor.reflected)
            })
            .collect();

        let msg = SparkMsg::Hello(HelloMsg {
            node_name: self.config.node_name.clone(),
            domain: self.config.domain.clone(),
            if_name: if_name.to_owned(),
            seq_num: self.seq_num,
            version: VERSION,
            neighbor_infos,
            sent_ts_us: now_us(),
            solicit_response,
            restarting,
            flood_opt_support: self.config.flood_opt_support,
            areas: self
                .config
                .areas
                .iter()
                .map(|area| area.0.clone())
                .collect(),
        });
        self.counters.hellos_tx += 1;
        self.send_msg(iface, &msg).await;
    }

    async fn send_handshake(
        &mut self,
        key: &(String, String),
        is_adj_established: bool,
    ) {
        let Some(iface) = self.interfaces.get(&key.0) else {
            return;
        };
        let Some(neighbor) = self.neighbors.get(key) else {
            return;
        };
        let Some(area) = neighbor.area.clone() else {
            return;
        };

        let msg = SparkMsg::Handshake(HandshakeMsg {
            node_name: self.config.node_name.clone(),
            is_adj_established,
            hold_time_ms: self.config.hold_time.as_millis() as u64,
            graceful_restart_time_ms: self
                .config
                .graceful_restart_time
                .as_millis() as u64,
            v4_addr: iface
                .info
                .v4_network
                .map(|network| network.ip())
                .filter(|_| self.config.v4_enabled),
            v6_addr: iface.info.v6_addr,
            area,
            ctrl_port: self.config.ctrl_port,
            kv_port: self.config.kv_port,
        });
        self.counters.handshakes_tx += 1;
        self.send_msg(iface, &msg).await;
    }

    async fn send_heartbeat(&mut self, if_name: &str) {
        let Some(iface) = self.interfaces.get(if_name) else {
            return;
        };
        self.heartbeat_seq += 1;
        let msg = SparkMsg::Heartbeat(HeartbeatMsg {
            node_name: self.config.node_name.clone(),
            seq_num: self.heartbeat_seq,
        });
        self.counters.heartbeats_tx += 1;
        self.send_msg(iface, &msg).await;
    }

    async fn send_msg(&self, iface: &SparkInterface, msg: &SparkMsg) {
        if let Err(error) = network::send_msg(
            &iface.socket,
            self.config.mcast_group,
            self.config.udp_port,
            iface.info.ifindex,
            msg,
        )
        .await
        {
            Error::from(error).log();
        }
    }

    async fn emit(&self, event: NeighborUpdate) {
        let _ = self.events_tx.send(event).await;
    }
}

// ===== impl SparkHandle =====

impl SparkHandle {
    /// Replaces the set of tracked interfaces.
    pub async fn update_interfaces(
        &self,
        interfaces: Vec<InterfaceInfo>,
    ) -> Result<(), Error> {
        self.request(|responder| Command::UpdateInterfaces {
            interfaces,
            responder,
        })
        .await
    }

    pub async fn get_neighbors(&self) -> Result<Vec<NeighborDump>, Error> {
        self.request(|responder| Command::GetNeighbors { responder })
            .await
    }

    pub async fn get_counters(&self) -> Result<SparkCounters, Error> {
        self.request(|responder| Command::GetCounters { responder })
            .await
    }

    /// Announces a graceful shutdown to all neighbors.
    pub async fn graceful_shutdown(&self) -> Result<(), Error> {
        self.request(|responder| Command::GracefulShutdown { responder })
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

// Discovery hellos are jittered to avoid synchronized bursts.
fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..1.25);
    period.mul_f64(factor)
}
