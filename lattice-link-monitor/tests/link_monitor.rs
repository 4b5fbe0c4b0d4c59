//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use lattice_config_store::ConfigStore;
use lattice_kvstore::types::KeyDumpParams;
use lattice_kvstore::{FloodRate, KvStore, KvStoreConfig, KvStoreHandle};
use lattice_link_monitor::{
    LinkEvent, LinkMonitor, LinkMonitorConfig, LinkMonitorHandle,
};
use lattice_prefix_manager::{PrefixManager, PrefixManagerConfig};
use lattice_spark::{NeighborInfo, NeighborUpdate, Spark, SparkConfig};
use lattice_utils::mpls::{Label, LabelRange};
use lattice_utils::routing::AdjacencyDatabase;
use lattice_utils::Area;
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;

struct Setup {
    monitor: LinkMonitorHandle,
    kvstore: KvStoreHandle,
    neighbor_tx: Sender<NeighborUpdate>,
    link_tx: Sender<LinkEvent>,
    _tempdir: tempfile::TempDir,
    _tasks: Vec<lattice_utils::task::Task<()>>,
}

async fn setup() -> Setup {
    let tempdir = tempfile::tempdir().unwrap();

    let (kvstore, _addr, kv_task) = KvStore::spawn(KvStoreConfig {
        node_name: "node1".to_owned(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        areas: vec![Area::default_area()],
        flood_rate: FloodRate::default(),
        enable_flood_optimization: false,
        is_flood_root: false,
        filters: None,
    })
    .await
    .unwrap();

    let (config_store, cs_task) =
        ConfigStore::spawn(tempdir.path().join("store.bin"))
            .await
            .unwrap();

    let (prefix_manager, pm_task) = PrefixManager::spawn(
        PrefixManagerConfig {
            node_name: "node1".to_owned(),
            areas: vec![Area::default_area()],
            per_prefix_keys: false,
            prefix_ttl_ms: 300_000,
            throttle: Duration::from_millis(10),
        },
        kvstore.clone(),
        config_store.clone(),
    )
    .await;

    let (spark, _spark_events, spark_task) = Spark::spawn(SparkConfig {
        node_name: "node1".to_owned(),
        domain: "lab".to_owned(),
        areas: vec![Area::default_area()],
        mcast_group: "ff02::abc".parse().unwrap(),
        udp_port: 6666,
        keep_alive_time: Duration::from_millis(200),
        fast_init_keep_alive_time: Duration::from_millis(50),
        handshake_time: Duration::from_millis(100),
        hold_time: Duration::from_millis(600),
        graceful_restart_time: Duration::from_secs(2),
        sr_label_range: LabelRange::new(1024, 2047).unwrap(),
        v4_enabled: false,
        v4_subnet_validation: false,
        max_packets_per_sec: 100,
        flood_opt_support: false,
        ctrl_port: 0,
        kv_port: 0,
    });

    // The test drives the monitor with synthetic spark and platform
    // events.
    let (neighbor_tx, neighbor_rx) = mpsc::channel(16);
    let (link_tx, link_rx) = mpsc::channel(16);

    let (monitor, lm_task) = LinkMonitor::spawn(
        LinkMonitorConfig {
            node_name: "node1".to_owned(),
            areas: vec![Area::default_area()],
            node_label: 101,
            include_interface_regexes: vec![],
            exclude_interface_regexes: vec!["^lo$".to_owned()],
            redistribute_interface_regexes: vec![],
            flap_initial_backoff: Duration::from_millis(100),
            flap_max_backoff: Duration::from_millis(400),
            adv_throttle: Duration::from_millis(10),
            adj_ttl_ms: 300_000,
        },
        spark,
        kvstore.clone(),
        prefix_manager,
        config_store,
        neighbor_rx,
        link_rx,
    )
    .await
    .unwrap();

    Setup {
        monitor,
        kvstore,
        neighbor_tx,
        link_tx,
        _tempdir: tempdir,
        _tasks: vec![kv_task, cs_task, pm_task, spark_task, lm_task],
    }
}

fn neighbor_info(if_name: &str, node_name: &str) -> NeighborInfo {
    NeighborInfo {
        node_name: node_name.to_owned(),
        if_name: if_name.to_owned(),
        remote_if_name: "eth9".to_owned(),
        area: Area::default_area(),
        v4_addr: None,
        v6_addr: "fe80::2".parse().unwrap(),
        label: Label::new(1025).unwrap(),
        rtt_us: Some(2_000),
        hold_time: Duration::from_secs(1),
        ctrl_port: 0,
        kv_port: 0,
    }
}

async fn fetch_adj_db(kvstore: &KvStoreHandle) -> Option<AdjacencyDatabase> {
    let dump = kvstore
        .dump_keys(
            Area::default_area(),
            KeyDumpParams {
                prefix: Some("adj:".to_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let value = dump.values().next()?;
    let bytes = value.value.as_ref()?;
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .ok()
        .map(|(db, _)| db)
}

async fn wait_for_db(
    kvstore: &KvStoreHandle,
    check: impl Fn(&AdjacencyDatabase) -> bool,
) -> AdjacencyDatabase {
    for _ in 0..100 {
        if let Some(db) = fetch_adj_db(kvstore).await {
            if check(&db) {
                return db;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("adjacency database never converged");
}

#[tokio::test]
async fn interface_overload_round_trip() {
    let setup = setup().await;

    setup
        .link_tx
        .send(LinkEvent::Up {
            if_name: "po1011".to_owned(),
            ifindex: 11,
        })
        .await
        .unwrap();
    setup
        .neighbor_tx
        .send(NeighborUpdate::Up(neighbor_info("po1011", "node2")))
        .await
        .unwrap();

    // Adjacency is originated without the overload bit.
    let db = wait_for_db(&setup.kvstore, |db| {
        db.adjacencies.len() == 1
    })
    .await;
    assert!(!db.adjacencies[0].is_overloaded);
    assert_eq!(db.node_label, 101);

    // Overloading the interface sets the bit on its adjacencies.
    setup
        .monitor
        .set_interface_overload("po1011".to_owned())
        .await
        .unwrap();
    wait_for_db(&setup.kvstore, |db| {
        db.adjacencies.len() == 1 && db.adjacencies[0].is_overloaded
    })
    .await;

    let details = setup.monitor.get_interfaces().await.unwrap();
    assert!(details[0].is_overloaded);

    // And unsetting restores it.
    setup
        .monitor
        .unset_interface_overload("po1011".to_owned())
        .await
        .unwrap();
    wait_for_db(&setup.kvstore, |db| {
        db.adjacencies.len() == 1 && !db.adjacencies[0].is_overloaded
    })
    .await;
}

#[tokio::test]
async fn node_overload_and_metrics() {
    let setup = setup().await;

    setup
        .link_tx
        .send(LinkEvent::Up {
            if_name: "eth0".to_owned(),
            ifindex: 1,
        })
        .await
        .unwrap();
    setup
        .neighbor_tx
        .send(NeighborUpdate::Up(neighbor_info("eth0", "node2")))
        .await
        .unwrap();

    // Wait for the link event to land before configuring overrides.
    wait_for_db(&setup.kvstore, |db| db.adjacencies.len() == 1).await;

    setup.monitor.set_node_overload().await.unwrap();
    setup
        .monitor
        .set_interface_metric("eth0".to_owned(), 50)
        .await
        .unwrap();
    setup
        .monitor
        .set_adjacency_metric("eth0".to_owned(), "node2".to_owned(), 77)
        .await
        .unwrap();

    // The per-adjacency override beats the per-interface one.
    let db = wait_for_db(&setup.kvstore, |db| {
        db.is_overloaded
            && db.adjacencies.len() == 1
            && db.adjacencies[0].metric == 77
    })
    .await;
    assert_eq!(db.adjacencies[0].metric, 77);

    setup
        .monitor
        .unset_adjacency_metric("eth0".to_owned(), "node2".to_owned())
        .await
        .unwrap();
    wait_for_db(&setup.kvstore, |db| {
        db.adjacencies.len() == 1 && db.adjacencies[0].metric == 50
    })
    .await;
}

#[tokio::test]
async fn flapping_interface_is_dampened() {
    let setup = setup().await;

    let up = LinkEvent::Up {
        if_name: "eth0".to_owned(),
        ifindex: 1,
    };
    setup.link_tx.send(up.clone()).await.unwrap();
    setup
        .link_tx
        .send(LinkEvent::Down {
            if_name: "eth0".to_owned(),
        })
        .await
        .unwrap();
    setup.link_tx.send(up).await.unwrap();

    // The second up lands inside the backoff window.
    let mut dampened = false;
    for _ in 0..50 {
        let details = setup.monitor.get_interfaces().await.unwrap();
        if details.iter().any(|iface| iface.is_dampened) {
            dampened = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(dampened);

    // Dampening lifts once the backoff elapses.
    let mut lifted = false;
    for _ in 0..100 {
        let details = setup.monitor.get_interfaces().await.unwrap();
        if details
            .iter()
            .any(|iface| iface.is_up && !iface.is_dampened)
        {
            lifted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(lifted);
}

#[tokio::test]
async fn unknown_interface_is_rejected() {
    let setup = setup().await;
    let result = setup
        .monitor
        .set_interface_overload("nope".to_owned())
        .await;
    assert!(result.is_err());
}
