//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;

use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Arg, Command};
use config::{Config, LoggingLevel, LoggingStyle};
use lattice_config_store::ConfigStore;
use lattice_ctrl::CtrlApi;
use lattice_decision::{Decision, DecisionConfig};
use lattice_fib::{Fib, FibConfig, MockPlatform};
use lattice_kvstore::types::PeerSpec;
use lattice_kvstore::{FloodRate, KvStore, KvStoreConfig};
use lattice_link_monitor::{LinkEvent, LinkMonitor, LinkMonitorConfig};
use lattice_prefix_manager::{PrefixManager, PrefixManagerConfig};
use lattice_spark::{Spark, SparkConfig};
use lattice_utils::mpls::LabelRange;
use lattice_utils::Area;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &config::Logging) {
    let level = match config.level {
        LoggingLevel::Error => "error",
        LoggingLevel::Warn => "warn",
        LoggingLevel::Info => "info",
        LoggingLevel::Debug => "debug",
        LoggingLevel::Trace => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(config.colors);
    let layer = match config.style {
        LoggingStyle::Compact => layer.compact().boxed(),
        LoggingStyle::Full => layer.boxed(),
        LoggingStyle::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() {
    let matches = Command::new("latticed")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Lattice distributed link-state routing daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to the configuration file"),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("failed to load configuration: {}", error);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    init_tracing(&config.logging);
    info!(node = %config.node.name, "starting");

    if let Err(error) = run(config).await {
        error!(%error, "fatal error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let node_name = config.node.name.clone();
    let areas = config
        .node
        .areas
        .iter()
        .map(|area| Area(area.clone()))
        .collect::<Vec<_>>();
    let default_area = areas
        .first()
        .cloned()
        .unwrap_or_else(Area::default_area);

    // Durable configuration store.
    let (config_store, _cs_task) =
        ConfigStore::spawn(config.node.storage_path.clone()).await?;

    // Replicated store.
    let (kvstore, kv_addr, _kv_task) = KvStore::spawn(KvStoreConfig {
        node_name: node_name.clone(),
        listen_addr: config.kvstore.listen_addr,
        areas: areas.clone(),
        flood_rate: FloodRate {
            msgs_per_sec: config.kvstore.flood_msgs_per_sec,
            burst_size: config.kvstore.flood_burst_size,
        },
        enable_flood_optimization: config
            .kvstore
            .enable_flood_optimization,
        is_flood_root: config.kvstore.is_flood_root,
        filters: None,
    })
    .await?;
    info!(%kv_addr, "kvstore listening");

    if !config.peers.is_empty() {
        let peers = config
            .peers
            .iter()
            .map(|peer| {
                (
                    peer.name.clone(),
                    PeerSpec {
                        pub_addr: peer.addr,
                        cmd_addr: peer.addr,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        for area in &areas {
            kvstore.add_peers(area.clone(), peers.clone()).await?;
        }
    }

    // Neighbor discovery.
    let sr_label_range = LabelRange::new(
        config.spark.sr_label_base,
        config.spark.sr_label_top,
    )?;
    let (spark, neighbor_events, _spark_task) = Spark::spawn(SparkConfig {
        node_name: node_name.clone(),
        domain: config.node.domain.clone(),
        areas: areas.clone(),
        mcast_group: config.spark.mcast_group.parse()?,
        udp_port: config.spark.udp_port,
        keep_alive_time: Duration::from_millis(
            config.spark.keep_alive_time_ms,
        ),
        fast_init_keep_alive_time: Duration::from_millis(
            config.spark.fast_init_keep_alive_time_ms,
        ),
        handshake_time: Duration::from_millis(
            config.spark.handshake_time_ms,
        ),
        hold_time: Duration::from_millis(config.spark.hold_time_ms),
        graceful_restart_time: Duration::from_millis(
            config.spark.graceful_restart_time_ms,
        ),
        sr_label_range,
        v4_enabled: config.spark.v4_enabled,
        v4_subnet_validation: config.spark.v4_subnet_validation,
        max_packets_per_sec: config.spark.max_packets_per_sec,
        flood_opt_support: config.kvstore.enable_flood_optimization,
        ctrl_port: 0,
        kv_port: kv_addr.port(),
    });

    // Prefix origination.
    let (prefix_manager, _pm_task) = PrefixManager::spawn(
        PrefixManagerConfig {
            node_name: node_name.clone(),
            areas: areas.clone(),
            per_prefix_keys: false,
            prefix_ttl_ms: 300_000,
            throttle: Duration::from_millis(100),
        },
        kvstore.clone(),
        config_store.clone(),
    )
    .await;

    // Link monitoring. Platform link events come from the static
    // interface configuration; a netlink watcher plugs into the same
    // channel.
    let (link_tx, link_rx) = mpsc::channel(64);
    let (link_monitor, _lm_task) = LinkMonitor::spawn(
        LinkMonitorConfig {
            node_name: node_name.clone(),
            areas: areas.clone(),
            node_label: config.node.node_label,
            include_interface_regexes: config
                .link_monitor
                .include_interfaces
                .clone(),
            exclude_interface_regexes: config
                .link_monitor
                .exclude_interfaces
                .clone(),
            redistribute_interface_regexes: config
                .link_monitor
                .redistribute_interfaces
                .clone(),
            flap_initial_backoff: Duration::from_millis(
                config.link_monitor.flap_initial_backoff_ms,
            ),
            flap_max_backoff: Duration::from_millis(
                config.link_monitor.flap_max_backoff_ms,
            ),
            adv_throttle: Duration::from_millis(100),
            adj_ttl_ms: config.link_monitor.adj_ttl_ms,
        },
        spark.clone(),
        kvstore.clone(),
        prefix_manager.clone(),
        config_store.clone(),
        neighbor_events,
        link_rx,
    )
    .await?;

    for interface in &config.interfaces {
        link_tx
            .send(LinkEvent::Up {
                if_name: interface.name.clone(),
                ifindex: interface.ifindex,
            })
            .await?;
        for addr in &interface.addrs {
            link_tx
                .send(LinkEvent::AddrAdd {
                    if_name: interface.name.clone(),
                    addr: addr.parse()?,
                })
                .await?;
        }
    }

    // Route computation.
    let (decision, route_updates, _dec_task) = Decision::spawn(
        DecisionConfig {
            node_name: node_name.clone(),
            debounce_min: Duration::from_millis(
                config.decision.debounce_min_ms,
            ),
            debounce_max: Duration::from_millis(
                config.decision.debounce_max_ms,
            ),
        },
        &kvstore,
    )
    .await?;

    // Forwarding plane programming. The in-memory platform stands in
    // until a kernel driver is injected here.
    let (fib, _fib_task) = Fib::spawn(
        FibConfig {
            node_name: node_name.clone(),
            area: default_area.clone(),
            dry_run: config.fib.dry_run,
            sync_interval: Duration::from_millis(
                config.fib.sync_interval_ms,
            ),
            retry_min_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(8),
            ordered_fib: config.fib.ordered_fib,
            ordered_fib_hold_max: Duration::from_secs(1),
        },
        Box::new(MockPlatform::default()),
        kvstore.clone(),
        route_updates,
    );

    // Operator surface, handed to whatever transport gets wired in.
    let _ctrl = CtrlApi::new(
        node_name,
        default_area,
        kvstore,
        decision,
        fib,
        link_monitor,
        prefix_manager,
        config_store,
    );

    info!("running");
    tokio::signal::ctrl_c().await?;

    // Say goodbye to the neighbors before the tasks unwind.
    info!("shutting down");
    let _ = spark.graceful_shutdown().await;

    Ok(())
}
