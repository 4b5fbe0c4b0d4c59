//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use lattice_kvstore::types::{
    KeyDumpParams, KeySetParams, PeerSpec, Value, TTL_INFINITY,
};
use lattice_kvstore::{FloodRate, KvStore, KvStoreConfig, KvStoreHandle};
use lattice_utils::Area;

fn config(node_name: &str) -> KvStoreConfig {
    KvStoreConfig {
        node_name: node_name.to_owned(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        areas: vec![Area::default_area()],
        flood_rate: FloodRate::default(),
        enable_flood_optimization: false,
        is_flood_root: false,
        filters: None,
    }
}

fn value(version: u64, originator: &str, bytes: &'static [u8]) -> Value {
    Value::new(version, originator, Bytes::from_static(bytes), TTL_INFINITY)
}

async fn set_one(
    store: &KvStoreHandle,
    key: &str,
    value: Value,
) {
    store
        .set_keys(
            Area::default_area(),
            KeySetParams {
                key_vals: BTreeMap::from([(key.to_owned(), value)]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

// Polls the store until `key` is visible or the deadline passes.
async fn wait_for_key(store: &KvStoreHandle, key: &str) -> Value {
    for _ in 0..100 {
        let found = store
            .get_keys(Area::default_area(), vec![key.to_owned()])
            .await
            .unwrap();
        if let Some(value) = found.get(key) {
            return value.clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("key {} never appeared", key);
}

#[tokio::test]
async fn filtered_dumps() {
    let (store, _addr, _task) =
        KvStore::spawn(config("node1")).await.unwrap();

    let keys: &[(&str, &str)] = &[
        ("key1", "node1"),
        ("key11", "node11"),
        ("key111", "node111"),
        ("key2", "node2"),
        ("key22", "node22"),
        ("key222", "node222"),
        ("key3", "node3"),
        ("key33", "node33"),
        ("key333", "node333"),
    ];
    for (key, originator) in keys {
        set_one(&store, key, value(1, originator, b"value")).await;
    }

    let params = KeyDumpParams {
        prefix: Some("key3".to_owned()),
        originator_ids: BTreeSet::from(["node3".to_owned()]),
        key_val_hashes: None,
    };
    let dump = store
        .dump_keys(Area::default_area(), params.clone())
        .await
        .unwrap();
    assert_eq!(
        dump.keys().cloned().collect::<Vec<_>>(),
        vec!["key3", "key33", "key333"]
    );
    assert!(dump.values().all(|value| value.value.is_some()));

    let hashes = store
        .dump_hashes(Area::default_area(), params)
        .await
        .unwrap();
    assert_eq!(
        hashes.keys().cloned().collect::<Vec<_>>(),
        vec!["key3", "key33", "key333"]
    );
    assert!(hashes.values().all(|value| value.value.is_none()));
}

#[tokio::test]
async fn subscription_sees_version_progression() {
    let (store, _addr, _task) =
        KvStore::spawn(config("node1")).await.unwrap();

    let mut stream = store.subscribe().await.unwrap();
    assert_eq!(store.subscriber_count().await.unwrap(), 1);

    // The duplicate version must not produce an event.
    set_one(&store, "snoop-key", value(1, "node1", b"a")).await;
    set_one(&store, "snoop-key", value(1, "node1", b"a")).await;
    set_one(&store, "snoop-key", value(2, "node1", b"b")).await;
    set_one(&store, "snoop-key", value(3, "node1", b"c")).await;

    let mut versions = vec![];
    for _ in 0..3 {
        let publication =
            tokio::time::timeout(Duration::from_secs(5), stream.recv())
                .await
                .expect("timed out waiting for publication")
                .unwrap();
        versions
            .extend(publication.key_vals.values().map(|v| v.version));
    }
    assert_eq!(versions, vec![1, 2, 3]);

    // No extra event is pending.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .is_err()
    );

    drop(stream);
    assert_eq!(store.subscriber_count().await.unwrap(), 0);
}

#[tokio::test]
async fn full_sync_converges_both_ways() {
    let (store_a, addr_a, _task_a) =
        KvStore::spawn(config("nodeA")).await.unwrap();
    let (store_b, _addr_b, _task_b) =
        KvStore::spawn(config("nodeB")).await.unwrap();

    // Each side holds something the other doesn't.
    set_one(&store_a, "adj:nodeA", value(1, "nodeA", b"a-data")).await;
    set_one(&store_b, "adj:nodeB", value(1, "nodeB", b"b-data")).await;

    store_b
        .add_peers(
            Area::default_area(),
            BTreeMap::from([(
                "nodeA".to_owned(),
                PeerSpec {
                    pub_addr: addr_a,
                    cmd_addr: addr_a,
                },
            )]),
        )
        .await
        .unwrap();

    // Full-sync exchanges both deltas.
    wait_for_key(&store_b, "adj:nodeA").await;
    wait_for_key(&store_a, "adj:nodeB").await;

    let peers = store_b.get_peers(Area::default_area()).await.unwrap();
    assert!(peers["nodeA"].initial_sync_done);

    // Live updates flood over the established connection, both ways.
    set_one(&store_a, "prefix:nodeA", value(1, "nodeA", b"p")).await;
    wait_for_key(&store_b, "prefix:nodeA").await;

    set_one(&store_b, "prefix:nodeB", value(1, "nodeB", b"q")).await;
    wait_for_key(&store_a, "prefix:nodeB").await;

    // A newer version overwrites everywhere.
    set_one(&store_b, "prefix:nodeA", value(2, "nodeB", b"p2")).await;
    for _ in 0..100 {
        let found = store_a
            .get_keys(
                Area::default_area(),
                vec!["prefix:nodeA".to_owned()],
            )
            .await
            .unwrap();
        if found["prefix:nodeA"].version == 2 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("version 2 never propagated");
}
