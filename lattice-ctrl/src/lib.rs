//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use bytes::Bytes;
use lattice_config_store::ConfigStoreHandle;
use lattice_decision::DecisionHandle;
use lattice_fib::FibHandle;
use lattice_kvstore::dual::DualMessage;
use lattice_kvstore::types::{
    KeyDumpParams, KeySetParams, PeerInfo, PeerSpec, Publication, SptInfo,
    Value,
};
use lattice_kvstore::KvStoreHandle;
use lattice_link_monitor::{InterfaceDetails, LinkMonitorHandle};
use lattice_prefix_manager::PrefixManagerHandle;
use lattice_spark::packet::{LOWEST_SUPPORTED_VERSION, VERSION};
use lattice_utils::routing::{
    AdjacencyDatabase, PerfEvents, PrefixDatabase, PrefixEntry,
    PrefixType, RouteDatabase,
};
use lattice_utils::Area;
use tokio::sync::mpsc::Receiver;

/// Typed error envelope returned by every control operation.
#[derive(Debug)]
pub struct CtrlError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    NotFound,
    Failure,
}

/// Synchronous operator surface over all components.
///
/// Transports (CLI, RPC servers) hold one of these and translate their
/// wire requests into method calls.
#[derive(Clone)]
pub struct CtrlApi {
    node_name: String,
    default_area: Area,
    kvstore: KvStoreHandle,
    decision: DecisionHandle,
    fib: FibHandle,
    link_monitor: LinkMonitorHandle,
    prefix_manager: PrefixManagerHandle,
    config_store: ConfigStoreHandle,
}

// ===== impl CtrlApi =====

impl CtrlApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: String,
        default_area: Area,
        kvstore: KvStoreHandle,
        decision: DecisionHandle,
        fib: FibHandle,
        link_monitor: LinkMonitorHandle,
        prefix_manager: PrefixManagerHandle,
        config_store: ConfigStoreHandle,
    ) -> CtrlApi {
        CtrlApi {
            node_name,
            default_area,
            kvstore,
            decision,
            fib,
            link_monitor,
            prefix_manager,
            config_store,
        }
    }

    // ===== identity =====

    pub fn get_my_node_name(&self) -> String {
        self.node_name.clone()
    }

    /// Protocol version pair: (current, lowest supported).
    pub fn get_version(&self) -> (u32, u32) {
        (VERSION, LOWEST_SUPPORTED_VERSION)
    }

    pub fn get_build_info(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "package".to_owned(),
                env!("CARGO_PKG_NAME").to_owned(),
            ),
            (
                "version".to_owned(),
                env!("CARGO_PKG_VERSION").to_owned(),
            ),
        ])
    }

    // ===== prefixes =====

    pub async fn advertise_prefixes(
        &self,
        prefixes: Vec<PrefixEntry>,
    ) -> Result<(), CtrlError> {
        Ok(self.prefix_manager.advertise_prefixes(prefixes).await?)
    }

    pub async fn withdraw_prefixes(
        &self,
        prefixes: Vec<PrefixEntry>,
    ) -> Result<(), CtrlError> {
        Ok(self.prefix_manager.withdraw_prefixes(prefixes).await?)
    }

    pub async fn withdraw_prefixes_by_type(
        &self,
        prefix_type: PrefixType,
    ) -> Result<(), CtrlError> {
        Ok(self
            .prefix_manager
            .withdraw_prefixes_by_type(prefix_type)
            .await?)
    }

    pub async fn sync_prefixes_by_type(
        &self,
        prefix_type: PrefixType,
        prefixes: Vec<PrefixEntry>,
    ) -> Result<(), CtrlError> {
        Ok(self
            .prefix_manager
            .sync_prefixes_by_type(prefix_type, prefixes)
            .await?)
    }

    pub async fn get_prefixes(
        &self,
    ) -> Result<Vec<PrefixEntry>, CtrlError> {
        Ok(self.prefix_manager.get_prefixes().await?)
    }

    pub async fn get_prefixes_by_type(
        &self,
        prefix_type: PrefixType,
    ) -> Result<Vec<PrefixEntry>, CtrlError> {
        Ok(self
            .prefix_manager
            .get_prefixes_by_type(prefix_type)
            .await?)
    }

    // ===== routes =====

    pub async fn get_route_db(&self) -> Result<RouteDatabase, CtrlError> {
        Ok(self.fib.get_route_db().await?)
    }

    pub async fn get_route_db_computed(
        &self,
        node_name: Option<String>,
    ) -> Result<RouteDatabase, CtrlError> {
        Ok(self.decision.get_route_db_computed(node_name).await?)
    }

    pub async fn get_perf_db(
        &self,
    ) -> Result<Vec<PerfEvents>, CtrlError> {
        Ok(self.fib.get_perf_db().await?)
    }

    // ===== decision =====

    pub async fn get_decision_adjacency_dbs(
        &self,
    ) -> Result<BTreeMap<String, AdjacencyDatabase>, CtrlError> {
        Ok(self.decision.get_adjacency_dbs().await?)
    }

    pub async fn get_decision_prefix_dbs(
        &self,
    ) -> Result<BTreeMap<String, PrefixDatabase>, CtrlError> {
        Ok(self.decision.get_prefix_dbs().await?)
    }

    // ===== kvstore =====

    pub async fn set_kv_store_key_vals(
        &self,
        key_vals: BTreeMap<String, Value>,
        area: Option<Area>,
    ) -> Result<(), CtrlError> {
        let params = KeySetParams {
            key_vals,
            ..Default::default()
        };
        Ok(self.kvstore.set_keys(self.area(area), params).await?)
    }

    /// Same as `set_kv_store_key_vals`, without waiting for the store
    /// to acknowledge.
    pub fn set_kv_store_key_vals_one_way(
        &self,
        key_vals: BTreeMap<String, Value>,
        area: Option<Area>,
    ) {
        let kvstore = self.kvstore.clone();
        let area = self.area(area);
        let params = KeySetParams {
            key_vals,
            ..Default::default()
        };
        tokio::spawn(async move {
            let _ = kvstore.set_keys(area, params).await;
        });
    }

    pub async fn get_kv_store_key_vals(
        &self,
        keys: Vec<String>,
        area: Option<Area>,
    ) -> Result<BTreeMap<String, Value>, CtrlError> {
        Ok(self.kvstore.get_keys(self.area(area), keys).await?)
    }

    pub async fn get_kv_store_key_vals_filtered(
        &self,
        params: KeyDumpParams,
        area: Option<Area>,
    ) -> Result<BTreeMap<String, Value>, CtrlError> {
        Ok(self.kvstore.dump_keys(self.area(area), params).await?)
    }

    pub async fn get_kv_store_hash_filtered(
        &self,
        params: KeyDumpParams,
        area: Option<Area>,
    ) -> Result<BTreeMap<String, Value>, CtrlError> {
        Ok(self.kvstore.dump_hashes(self.area(area), params).await?)
    }

    pub async fn process_kv_store_dual_message(
        &self,
        message: DualMessage,
        area: Option<Area>,
    ) -> Result<(), CtrlError> {
        Ok(self
            .kvstore
            .process_dual_message(self.area(area), message)
            .await?)
    }

    pub async fn update_flood_topology_child(
        &self,
        root: String,
        child: String,
        set: bool,
        area: Option<Area>,
    ) -> Result<(), CtrlError> {
        Ok(self
            .kvstore
            .update_flood_topology_child(self.area(area), root, child, set)
            .await?)
    }

    pub async fn get_spanning_tree_infos(
        &self,
        area: Option<Area>,
    ) -> Result<Vec<SptInfo>, CtrlError> {
        Ok(self
            .kvstore
            .get_spanning_tree_infos(self.area(area))
            .await?)
    }

    pub async fn add_update_kv_store_peers(
        &self,
        peers: BTreeMap<String, PeerSpec>,
        area: Option<Area>,
    ) -> Result<(), CtrlError> {
        Ok(self.kvstore.add_peers(self.area(area), peers).await?)
    }

    pub async fn delete_kv_store_peers(
        &self,
        peers: Vec<String>,
        area: Option<Area>,
    ) -> Result<(), CtrlError> {
        Ok(self.kvstore.del_peers(self.area(area), peers).await?)
    }

    pub async fn get_kv_store_peers(
        &self,
        area: Option<Area>,
    ) -> Result<BTreeMap<String, PeerInfo>, CtrlError> {
        Ok(self.kvstore.get_peers(self.area(area)).await?)
    }

    pub async fn subscribe_kv_store(
        &self,
    ) -> Result<Receiver<Publication>, CtrlError> {
        Ok(self.kvstore.subscribe().await?)
    }

    pub async fn subscribe_and_get_kv_store(
        &self,
    ) -> Result<(Publication, Receiver<Publication>), CtrlError> {
        Ok(self.kvstore.subscribe_and_get().await?)
    }

    // ===== link monitor =====

    pub async fn set_node_overload(&self) -> Result<(), CtrlError> {
        Ok(self.link_monitor.set_node_overload().await?)
    }

    pub async fn unset_node_overload(&self) -> Result<(), CtrlError> {
        Ok(self.link_monitor.unset_node_overload().await?)
    }

    pub async fn set_interface_overload(
        &self,
        if_name: String,
    ) -> Result<(), CtrlError> {
        Ok(self.link_monitor.set_interface_overload(if_name).await?)
    }

    pub async fn unset_interface_overload(
        &self,
        if_name: String,
    ) -> Result<(), CtrlError> {
        Ok(self
            .link_monitor
            .unset_interface_overload(if_name)
            .await?)
    }

    pub async fn set_interface_metric(
        &self,
        if_name: String,
        metric: u32,
    ) -> Result<(), CtrlError> {
        Ok(self
            .link_monitor
            .set_interface_metric(if_name, metric)
            .await?)
    }

    pub async fn unset_interface_metric(
        &self,
        if_name: String,
    ) -> Result<(), CtrlError> {
        Ok(self.link_monitor.unset_interface_metric(if_name).await?)
    }

    pub async fn set_adjacency_metric(
        &self,
        if_name: String,
        adj_node: String,
        metric: u32,
    ) -> Result<(), CtrlError> {
        Ok(self
            .link_monitor
            .set_adjacency_metric(if_name, adj_node, metric)
            .await?)
    }

    pub async fn unset_adjacency_metric(
        &self,
        if_name: String,
        adj_node: String,
    ) -> Result<(), CtrlError> {
        Ok(self
            .link_monitor
            .unset_adjacency_metric(if_name, adj_node)
            .await?)
    }

    pub async fn get_interfaces(
        &self,
    ) -> Result<Vec<InterfaceDetails>, CtrlError> {
        Ok(self.link_monitor.get_interfaces().await?)
    }

    // ===== config store =====

    pub async fn set_config_key(
        &self,
        key: String,
        value: Bytes,
    ) -> Result<(), CtrlError> {
        Ok(self.config_store.set_config_key(key, value).await?)
    }

    pub async fn get_config_key(
        &self,
        key: String,
    ) -> Result<Bytes, CtrlError> {
        Ok(self.config_store.get_config_key(key).await?)
    }

    pub async fn erase_config_key(
        &self,
        key: String,
    ) -> Result<(), CtrlError> {
        Ok(self.config_store.erase_config_key(key).await?)
    }

    // ===== health checker =====

    /// The health checker module is not part of this build.
    pub fn get_health_checker_info(&self) -> Result<(), CtrlError> {
        Err(CtrlError {
            code: ErrorCode::NotFound,
            message: "health checker is not enabled".to_owned(),
        })
    }

    fn area(&self, area: Option<Area>) -> Area {
        area.unwrap_or_else(|| self.default_area.clone())
    }
}

// ===== impl CtrlError =====

impl std::fmt::Display for CtrlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            ErrorCode::NotFound => {
                write!(f, "not found: {}", self.message)
            }
            ErrorCode::Failure => {
                write!(f, "failure: {}", self.message)
            }
        }
    }
}

impl std::error::Error for CtrlError {}

impl From<lattice_kvstore::Error> for CtrlError {
    fn from(error: lattice_kvstore::Error) -> CtrlError {
        CtrlError {
            code: ErrorCode::Failure,
            message: error.to_string(),
        }
    }
}

impl From<lattice_config_store::Error> for CtrlError {
    fn from(error: lattice_config_store::Error) -> CtrlError {
        let code = match &error {
            lattice_config_store::Error::NotFound(_) => {
                ErrorCode::NotFound
            }
            _ => ErrorCode::Failure,
        };
        CtrlError {
            code,
            message: error.to_string(),
        }
    }
}

impl From<lattice_prefix_manager::Error> for CtrlError {
    fn from(error: lattice_prefix_manager::Error) -> CtrlError {
        let code = match &error {
            lattice_prefix_manager::Error::NotFound => ErrorCode::NotFound,
            _ => ErrorCode::Failure,
        };
        CtrlError {
            code,
            message: error.to_string(),
        }
    }
}

impl From<lattice_link_monitor::Error> for CtrlError {
    fn from(error: lattice_link_monitor::Error) -> CtrlError {
        let code = match &error {
            lattice_link_monitor::Error::InterfaceNotFound(_) => {
                ErrorCode::NotFound
            }
            _ => ErrorCode::Failure,
        };
        CtrlError {
            code,
            message: error.to_string(),
        }
    }
}

impl From<lattice_decision::Error> for CtrlError {
    fn from(error: lattice_decision::Error) -> CtrlError {
        CtrlError {
            code: ErrorCode::Failure,
            message: error.to_string(),
        }
    }
}

impl From<lattice_fib::Error> for CtrlError {
    fn from(error: lattice_fib::Error) -> CtrlError {
        CtrlError {
            code: ErrorCode::Failure,
            message: error.to_string(),
        }
    }
}
