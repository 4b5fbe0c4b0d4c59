//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub node: Node,
    pub logging: Logging,
    pub kvstore: KvStoreSection,
    pub spark: SparkSection,
    pub decision: DecisionSection,
    pub fib: FibSection,
    pub link_monitor: LinkMonitorSection,
    // Statically configured interfaces fed to the link monitor at
    // startup, until a platform link watcher is wired in.
    pub interfaces: Vec<StaticInterface>,
    // Statically configured KvStore peers.
    pub peers: Vec<StaticPeer>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Node {
    pub name: String,
    pub domain: String,
    pub areas: Vec<String>,
    pub node_label: u32,
    pub storage_path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub level: LoggingLevel,
    pub style: LoggingStyle,
    pub colors: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingStyle {
    #[default]
    Compact,
    Full,
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KvStoreSection {
    pub listen_addr: SocketAddr,
    pub flood_msgs_per_sec: u32,
    pub flood_burst_size: u32,
    pub enable_flood_optimization: bool,
    pub is_flood_root: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SparkSection {
    pub mcast_group: String,
    pub udp_port: u16,
    pub keep_alive_time_ms: u64,
    pub fast_init_keep_alive_time_ms: u64,
    pub handshake_time_ms: u64,
    pub hold_time_ms: u64,
    pub graceful_restart_time_ms: u64,
    pub sr_label_base: u32,
    pub sr_label_top: u32,
    pub v4_enabled: bool,
    pub v4_subnet_validation: bool,
    pub max_packets_per_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecisionSection {
    pub debounce_min_ms: u64,
    pub debounce_max_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FibSection {
    pub dry_run: bool,
    pub sync_interval_ms: u64,
    pub ordered_fib: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkMonitorSection {
    pub include_interfaces: Vec<String>,
    pub exclude_interfaces: Vec<String>,
    pub redistribute_interfaces: Vec<String>,
    pub flap_initial_backoff_ms: u64,
    pub flap_max_backoff_ms: u64,
    pub adj_ttl_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticInterface {
    pub name: String,
    pub ifindex: u32,
    #[serde(default)]
    pub addrs: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticPeer {
    pub name: String,
    pub addr: SocketAddr,
}

// ===== impl Config =====

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|error| format!("{}: {}", path, error))?;
        toml::from_str(&contents)
            .map_err(|error| format!("{}: {}", path, error))
    }
}

// ===== defaults =====

impl Default for Node {
    fn default() -> Node {
        Node {
            name: "node1".to_owned(),
            domain: "default".to_owned(),
            areas: vec!["0".to_owned()],
            node_label: 65001,
            storage_path: PathBuf::from("/var/lib/latticed/store.bin"),
        }
    }
}

impl Default for KvStoreSection {
    fn default() -> KvStoreSection {
        KvStoreSection {
            listen_addr: "[::]:60001".parse().unwrap(),
            flood_msgs_per_sec: 1024,
            flood_burst_size: 256,
            enable_flood_optimization: false,
            is_flood_root: false,
        }
    }
}

impl Default for SparkSection {
    fn default() -> SparkSection {
        SparkSection {
            mcast_group: "ff02::1".to_owned(),
            udp_port: 6666,
            keep_alive_time_ms: 2_000,
            fast_init_keep_alive_time_ms: 100,
            handshake_time_ms: 500,
            hold_time_ms: 10_000,
            graceful_restart_time_ms: 30_000,
            sr_label_base: 50_000,
            sr_label_top: 59_999,
            v4_enabled: false,
            v4_subnet_validation: false,
            max_packets_per_sec: 100,
        }
    }
}

impl Default for DecisionSection {
    fn default() -> DecisionSection {
        DecisionSection {
            debounce_min_ms: 100,
            debounce_max_ms: 500,
        }
    }
}

impl Default for FibSection {
    fn default() -> FibSection {
        FibSection {
            dry_run: true,
            sync_interval_ms: 60_000,
            ordered_fib: false,
        }
    }
}

impl Default for LinkMonitorSection {
    fn default() -> LinkMonitorSection {
        LinkMonitorSection {
            include_interfaces: vec![],
            exclude_interfaces: vec!["^lo$".to_owned()],
            redistribute_interfaces: vec![],
            flap_initial_backoff_ms: 1_000,
            flap_max_backoff_ms: 60_000,
            adj_ttl_ms: 300_000,
        }
    }
}
