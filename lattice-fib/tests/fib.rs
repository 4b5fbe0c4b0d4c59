//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::time::Duration;

use ipnetwork::IpNetwork;
use lattice_fib::{Fib, FibConfig, MockPlatform};
use lattice_kvstore::{FloodRate, KvStore, KvStoreConfig, KvStoreHandle};
use lattice_utils::routing::{NextHop, RouteDatabaseDelta};
use lattice_utils::Area;
use tokio::sync::mpsc;

async fn kvstore() -> KvStoreHandle {
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
    // Keep the store alive for the whole test.
    std::mem::forget(task);
    handle
}

fn fib_config() -> FibConfig {
    FibConfig {
        node_name: "node1".to_owned(),
        area: Area::default_area(),
        dry_run: false,
        sync_interval: Duration::from_millis(100),
        retry_min_backoff: Duration::from_millis(10),
        retry_max_backoff: Duration::from_millis(100),
        ordered_fib: false,
        ordered_fib_hold_max: Duration::from_millis(500),
    }
}

fn next_hop() -> NextHop {
    NextHop {
        address: "fe80::1".parse().unwrap(),
        if_name: "eth0".to_owned(),
        metric: 10,
        mpls_action: None,
        use_non_shortest_route: false,
    }
}

fn update_delta(prefix: &str) -> RouteDatabaseDelta {
    RouteDatabaseDelta {
        unicast_routes_to_update: BTreeMap::from([(
            prefix.parse::<IpNetwork>().unwrap(),
            vec![next_hop()],
        )]),
        ..Default::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn programs_full_set_then_deltas() {
    let kvstore = kvstore().await;
    let platform = MockPlatform::default();
    let (updates_tx, updates_rx) = mpsc::channel(16);
    let (fib, _task) = Fib::spawn(
        fib_config(),
        Box::new(platform.clone()),
        kvstore,
        updates_rx,
    );

    // First delta triggers the full programming.
    updates_tx.send(update_delta("10.0.0.0/8")).await.unwrap();
    let prefix: IpNetwork = "10.0.0.0/8".parse().unwrap();
    wait_until(|| {
        platform.state.lock().unwrap().unicast.contains_key(&prefix)
    })
    .await;

    // Subsequent deltas apply incrementally.
    let gone: IpNetwork = "10.0.0.0/8".parse().unwrap();
    let added: IpNetwork = "11.0.0.0/8".parse().unwrap();
    updates_tx
        .send(RouteDatabaseDelta {
            unicast_routes_to_update: BTreeMap::from([(
                added,
                vec![next_hop()],
            )]),
            unicast_routes_to_delete: vec![gone],
            ..Default::default()
        })
        .await
        .unwrap();
    wait_until(|| {
        let state = platform.state.lock().unwrap();
        state.unicast.contains_key(&added)
            && !state.unicast.contains_key(&gone)
    })
    .await;

    let route_db = fib.get_route_db().await.unwrap();
    assert_eq!(
        route_db.unicast_routes.keys().collect::<Vec<_>>(),
        vec![&added]
    );

    // Perf markers are retained per computation.
    let perf_db = fib.get_perf_db().await.unwrap();
    assert_eq!(perf_db.len(), 2);
    assert!(perf_db.iter().all(|events| {
        events
            .events
            .iter()
            .any(|event| event.event_name == "FIB_PROGRAMMED")
    }));
}

#[tokio::test]
async fn reconcile_repairs_platform_drift() {
    let kvstore = kvstore().await;
    let platform = MockPlatform::default();
    let (updates_tx, updates_rx) = mpsc::channel(16);
    let (_fib, _task) = Fib::spawn(
        fib_config(),
        Box::new(platform.clone()),
        kvstore,
        updates_rx,
    );

    updates_tx.send(update_delta("10.0.0.0/8")).await.unwrap();
    let prefix: IpNetwork = "10.0.0.0/8".parse().unwrap();
    wait_until(|| {
        platform.state.lock().unwrap().unicast.contains_key(&prefix)
    })
    .await;

    // Someone wipes the route behind our back; the periodic sync puts
    // it back.
    platform.state.lock().unwrap().unicast.clear();
    wait_until(|| {
        platform.state.lock().unwrap().unicast.contains_key(&prefix)
    })
    .await;
}

#[tokio::test]
async fn dry_run_never_touches_platform() {
    let kvstore = kvstore().await;
    let platform = MockPlatform::default();
    let (updates_tx, updates_rx) = mpsc::channel(16);
    let mut config = fib_config();
    config.dry_run = true;
    let (fib, _task) = Fib::spawn(
        config,
        Box::new(platform.clone()),
        kvstore,
        updates_rx,
    );

    updates_tx.send(update_delta("10.0.0.0/8")).await.unwrap();
    let prefix: IpNetwork = "10.0.0.0/8".parse().unwrap();

    // The intended set is maintained...
    let mut found = false;
    for _ in 0..100 {
        let db = fib.get_route_db().await.unwrap();
        if db.unicast_routes.contains_key(&prefix) {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found);

    // ...but the platform is never touched.
    assert!(platform.state.lock().unwrap().unicast.is_empty());
}
