//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use bytes::Bytes;
use ipnetwork::IpNetwork;
use lattice_config_store::{ConfigStore, ConfigStoreHandle};
use lattice_kvstore::{FloodRate, KvStore, KvStoreConfig, KvStoreHandle};
use lattice_prefix_manager::{
    Error, PrefixManager, PrefixManagerConfig, PrefixManagerHandle,
};
use lattice_utils::routing::{
    ForwardingAlgorithm, ForwardingType, PrefixEntry, PrefixType,
};
use lattice_utils::Area;

struct Setup {
    manager: PrefixManagerHandle,
    config_store: ConfigStoreHandle,
    _tempdir: tempfile::TempDir,
    _tasks: Vec<lattice_utils::task::Task<()>>,
}

async fn kvstore() -> (KvStoreHandle, lattice_utils::task::Task<()>) {
    let config = KvStoreConfig {
        node_name: "node1".to_owned(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        areas: vec![Area::default_area()],
        flood_rate: FloodRate::default(),
        enable_flood_optimization: false,
        is_flood_root: false,
        filters: None,
    };
    let (handle, _addr, task) = KvStore::spawn(config).await.unwrap();
    (handle, task)
}

async fn setup() -> Setup {
    let tempdir = tempfile::tempdir().unwrap();
    let config_store_path = tempdir.path().join("store.bin");

    let (kvstore, kv_task) = kvstore().await;
    let (config_store, cs_task) =
        ConfigStore::spawn(config_store_path).await.unwrap();
    let (manager, pm_task) = PrefixManager::spawn(
        PrefixManagerConfig {
            node_name: "node1".to_owned(),
            areas: vec![Area::default_area()],
            per_prefix_keys: false,
            prefix_ttl_ms: 300_000,
            throttle: Duration::from_millis(10),
        },
        kvstore,
        config_store.clone(),
    )
    .await;

    Setup {
        manager,
        config_store,
        _tempdir: tempdir,
        _tasks: vec![kv_task, cs_task, pm_task],
    }
}

fn entry(prefix: &str, prefix_type: PrefixType) -> PrefixEntry {
    PrefixEntry {
        prefix: prefix.parse::<IpNetwork>().unwrap(),
        prefix_type,
        data: Bytes::new(),
        forwarding_type: ForwardingType::Ip,
        forwarding_algorithm: ForwardingAlgorithm::SpEcmp,
        ephemeral: false,
        metric_vector: None,
    }
}

#[tokio::test]
async fn prefix_lifecycle() {
    let setup = setup().await;
    let manager = &setup.manager;

    manager
        .advertise_prefixes(vec![
            entry("10.0.0.0/8", PrefixType::Loopback),
            entry("11.0.0.0/8", PrefixType::Loopback),
            entry("20.0.0.0/8", PrefixType::Bgp),
            entry("21.0.0.0/8", PrefixType::Bgp),
        ])
        .await
        .unwrap();
    assert_eq!(manager.get_prefixes().await.unwrap().len(), 4);

    manager
        .withdraw_prefixes(vec![entry("21.0.0.0/8", PrefixType::Bgp)])
        .await
        .unwrap();

    manager
        .withdraw_prefixes_by_type(PrefixType::Loopback)
        .await
        .unwrap();

    manager
        .sync_prefixes_by_type(
            PrefixType::Bgp,
            vec![entry("23.0.0.0/8", PrefixType::Bgp)],
        )
        .await
        .unwrap();

    let prefixes = manager.get_prefixes().await.unwrap();
    assert_eq!(prefixes.len(), 1);
    assert_eq!(
        prefixes[0].prefix,
        "23.0.0.0/8".parse::<IpNetwork>().unwrap()
    );
    assert_eq!(prefixes[0].prefix_type, PrefixType::Bgp);

    assert!(manager
        .get_prefixes_by_type(PrefixType::Loopback)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn withdraw_is_atomic() {
    let setup = setup().await;
    let manager = &setup.manager;

    manager
        .advertise_prefixes(vec![entry("10.0.0.0/8", PrefixType::Bgp)])
        .await
        .unwrap();

    // One bad entry fails the whole batch without side effects.
    let result = manager
        .withdraw_prefixes(vec![
            entry("10.0.0.0/8", PrefixType::Bgp),
            entry("99.0.0.0/8", PrefixType::Bgp),
        ])
        .await;
    assert!(matches!(result, Err(Error::NotFound)));
    assert_eq!(manager.get_prefixes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn re_advertising_is_idempotent() {
    let setup = setup().await;
    let manager = &setup.manager;

    let entries = vec![
        entry("10.0.0.0/8", PrefixType::Loopback),
        entry("20.0.0.0/8", PrefixType::Bgp),
    ];
    manager.advertise_prefixes(entries.clone()).await.unwrap();
    manager.advertise_prefixes(entries).await.unwrap();

    assert_eq!(manager.get_prefixes().await.unwrap().len(), 2);
}

#[tokio::test]
async fn non_ephemeral_prefixes_survive_restart() {
    let setup = setup().await;

    let mut ephemeral = entry("20.0.0.0/8", PrefixType::Bgp);
    ephemeral.ephemeral = true;
    setup
        .manager
        .advertise_prefixes(vec![
            entry("10.0.0.0/8", PrefixType::Loopback),
            ephemeral,
        ])
        .await
        .unwrap();

    // A fresh prefix manager over the same config store restores only
    // the durable entry.
    let (kvstore, _kv_task) = kvstore().await;
    let (manager, _pm_task) = PrefixManager::spawn(
        PrefixManagerConfig {
            node_name: "node1".to_owned(),
            areas: vec![Area::default_area()],
            per_prefix_keys: false,
            prefix_ttl_ms: 300_000,
            throttle: Duration::from_millis(10),
        },
        kvstore,
        setup.config_store.clone(),
    )
    .await;

    let prefixes = manager.get_prefixes().await.unwrap();
    assert_eq!(prefixes.len(), 1);
    assert_eq!(prefixes[0].prefix_type, PrefixType::Loopback);
}
