//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ipnetwork::IpNetwork;
use lattice_config_store::ConfigStoreHandle;
use lattice_kvstore::types::{KeySetParams, Value};
use lattice_kvstore::KvStoreHandle;
use lattice_utils::routing::{
    per_prefix_key, prefix_key, PrefixDatabase, PrefixEntry, PrefixType,
};
use lattice_utils::task::Task;
use lattice_utils::Area;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, warn, Instrument};

// Config store key holding the non-ephemeral prefixes.
const PERSIST_KEY: &str = "prefix-manager:prefixes";

/// PrefixManager configuration.
#[derive(Clone, Debug)]
pub struct PrefixManagerConfig {
    pub node_name: String,
    pub areas: Vec<Area>,
    // One key per prefix instead of one per node.
    pub per_prefix_keys: bool,
    pub prefix_ttl_ms: i64,
    // Origination batching window.
    pub throttle: Duration,
}

// Requests accepted by the prefix manager task.
#[derive(Debug)]
enum Command {
    Advertise {
        entries: Vec<PrefixEntry>,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    Withdraw {
        entries: Vec<PrefixEntry>,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    WithdrawByType {
        prefix_type: PrefixType,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    SyncByType {
        prefix_type: PrefixType,
        entries: Vec<PrefixEntry>,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    GetAll {
        responder: oneshot::Sender<Vec<PrefixEntry>>,
    },
    GetByType {
        prefix_type: PrefixType,
        responder: oneshot::Sender<Vec<PrefixEntry>>,
    },
}

/// Client handle to a running prefix manager task.
#[derive(Clone, Debug)]
pub struct PrefixManagerHandle {
    cmd_tx: Sender<Command>,
}

/// Batched originator of prefix advertisements.
///
/// Mutations apply atomically to the in-memory sets; KvStore
/// origination is debounced and best-effort, withdrawal leaves a
/// tombstone for the TTL to collect.
pub struct PrefixManager {
    config: PrefixManagerConfig,
    kvstore: KvStoreHandle,
    config_store: ConfigStoreHandle,
    // Advertised prefixes, bucketed by source.
    prefix_map: BTreeMap<PrefixType, BTreeMap<IpNetwork, PrefixEntry>>,
    // Keys currently live in the store, so withdrawal knows what to
    // tombstone.
    published_keys: BTreeSet<String>,
    pending_since: Option<Instant>,
    cmd_rx: Receiver<Command>,
}

// ===== impl PrefixManager =====

impl PrefixManager {
    /// Restores persisted prefixes and spawns the task.
    pub async fn spawn(
        config: PrefixManagerConfig,
        kvstore: KvStoreHandle,
        config_store: ConfigStoreHandle,
    ) -> (PrefixManagerHandle, Task<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let mut manager = PrefixManager {
            config,
            kvstore,
            config_store,
            prefix_map: BTreeMap::new(),
            published_keys: BTreeSet::new(),
            pending_since: None,
            cmd_rx,
        };
        manager.restore().await;

        let task = Task::spawn(
            manager.run().instrument(debug_span!("prefix-manager")),
        );
        (PrefixManagerHandle { cmd_tx }, task)
    }

    async fn restore(&mut self) {
        let persisted = match self
            .config_store
            .get_config_key(PERSIST_KEY.to_owned())
            .await
        {
            Ok(bytes) => bytes,
            Err(lattice_config_store::Error::NotFound(_)) => return,
            Err(error) => {
                warn!(%error, "failed to restore persisted prefixes");
                return;
            }
        };
        match bincode::serde::decode_from_slice::<Vec<PrefixEntry>, _>(
            &persisted,
            bincode::config::standard(),
        ) {
            Ok((entries, _)) => {
                debug!(count = entries.len(), "restored prefixes");
                for entry in entries {
                    self.prefix_map
                        .entry(entry.prefix_type)
                        .or_default()
                        .insert(entry.prefix, entry);
                }
                self.schedule_origination();
            }
            Err(error) => {
                warn!(%error, "persisted prefixes are corrupt");
            }
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self
                .pending_since
                .map(|since| since + self.config.throttle);

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.process_command(cmd).await;
                }
                _ = tokio::time::sleep_until(
                    deadline
                        .unwrap_or_else(|| {
                            Instant::now() + Duration::from_secs(3600)
                        })
                        .into(),
                ), if deadline.is_some() => {
                    self.pending_since = None;
                    self.originate().await;
                }
            }
        }
    }

    async fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::Advertise { entries, responder } => {
                debug!(count = entries.len(), "advertise prefixes");
                for entry in entries {
                    self.prefix_map
                        .entry(entry.prefix_type)
                        .or_default()
                        .insert(entry.prefix, entry);
                }
                self.after_mutation().await;
                let _ = responder.send(Ok(()));
            }
            Command::Withdraw { entries, responder } => {
                // The batch is atomic: verify everything exists before
                // touching the maps.
                let missing = entries.iter().any(|entry| {
                    self.prefix_map
                        .get(&entry.prefix_type)
                        .map(|prefixes| {
                            !prefixes.contains_key(&entry.prefix)
                        })
                        .unwrap_or(true)
                });
                if missing {
                    let _ = responder.send(Err(Error::NotFound));
                    return;
                }
                debug!(count = entries.len(), "withdraw prefixes");
                for entry in entries {
                    if let Some(prefixes) =
                        self.prefix_map.get_mut(&entry.prefix_type)
                    {
                        prefixes.remove(&entry.prefix);
                    }
                }
                self.after_mutation().await;
                let _ = responder.send(Ok(()));
            }
            Command::WithdrawByType {
                prefix_type,
                responder,
            } => {
                debug!(?prefix_type, "withdraw prefixes by type");
                self.prefix_map.remove(&prefix_type);
                self.after_mutation().await;
                let _ = responder.send(Ok(()));
            }
            Command::SyncByType {
                prefix_type,
                entries,
                responder,
            } => {
                debug!(
                    ?prefix_type,
                    count = entries.len(),
                    "sync prefixes by type"
                );
                let prefixes = entries
                    .into_iter()
                    .filter(|entry| entry.prefix_type == prefix_type)
                    .map(|entry| (entry.prefix, entry))
                    .collect();
                self.prefix_map.insert(prefix_type, prefixes);
                self.after_mutation().await;
                let _ = responder.send(Ok(()));
            }
            Command::GetAll { responder } => {
                let _ = responder.send(self.all_entries());
            }
            Command::GetByType {
                prefix_type,
                responder,
            } => {
                let entries = self
                    .prefix_map
                    .get(&prefix_type)
                    .map(|prefixes| {
                        prefixes.values().cloned().collect()
                    })
                    .unwrap_or_default();
                let _ = responder.send(entries);
            }
        }
    }

    fn all_entries(&self) -> Vec<PrefixEntry> {
        self.prefix_map
            .values()
            .flat_map(|prefixes| prefixes.values().cloned())
            .collect()
    }

    async fn after_mutation(&mut self) {
        self.persist().await;
        self.schedule_origination();
    }

    // Persists the non-ephemeral entries.
    async fn persist(&self) {
        let entries = self
            .all_entries()
            .into_iter()
            .filter(|entry| !entry.ephemeral)
            .collect::<Vec<_>>();
        let payload = match bincode::serde::encode_to_vec(
            &entries,
            bincode::config::standard(),
        ) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode prefixes");
                return;
            }
        };
        if let Err(error) = self
            .config_store
            .set_config_key(PERSIST_KEY.to_owned(), Bytes::from(payload))
            .await
        {
            warn!(%error, "failed to persist prefixes");
        }
    }

    fn schedule_origination(&mut self) {
        self.pending_since.get_or_insert_with(Instant::now);
    }

    // Publishes the current sets into every area, tombstoning keys
    // that no longer carry prefixes.
    async fn originate(&mut self) {
        let entries = self.all_entries();
        let mut live_keys = BTreeSet::new();
        let areas = self.config.areas.clone();

        for area in &areas {
            if self.config.per_prefix_keys {
                for entry in &entries {
                    let key = per_prefix_key(
                        &self.config.node_name,
                        area,
                        &entry.prefix,
                    );
                    let db = PrefixDatabase {
                        this_node_name: self.config.node_name.clone(),
                        prefix_entries: vec![entry.clone()],
                        delete_prefix: false,
                    };
                    self.publish(area, key.clone(), db).await;
                    live_keys.insert(key);
                }
            } else {
                let key = prefix_key(&self.config.node_name, area);
                if !entries.is_empty() {
                    let db = PrefixDatabase {
                        this_node_name: self.config.node_name.clone(),
                        prefix_entries: entries.clone(),
                        delete_prefix: false,
                    };
                    self.publish(area, key.clone(), db).await;
                    live_keys.insert(key);
                }
            }

            // Tombstone everything that went away; the TTL garbage
            // collects the remains.
            let dead_keys = self
                .published_keys
                .iter()
                .filter(|key| {
                    key.starts_with(&format!(
                        "prefix:{}:{}",
                        self.config.node_name, area
                    )) && !live_keys.contains(*key)
                })
                .cloned()
                .collect::<Vec<_>>();
            for key in dead_keys {
                let db = PrefixDatabase {
                    this_node_name: self.config.node_name.clone(),
                    prefix_entries: vec![],
                    delete_prefix: true,
                };
                self.publish(area, key, db).await;
            }
        }

        self.published_keys = live_keys;
    }

    async fn publish(&self, area: &Area, key: String, db: PrefixDatabase) {
        let payload = match bincode::serde::encode_to_vec(
            &db,
            bincode::config::standard(),
        ) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode prefix database");
                return;
            }
        };

        // Bump past the version already in the store, surviving
        // restarts.
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
            self.config.prefix_ttl_ms,
        );
        let params = KeySetParams {
            key_vals: BTreeMap::from([(key.clone(), value)]),
            // Tombstones are left for the TTL to collect.
            refresh_ttl: !db.delete_prefix,
            ..Default::default()
        };
        if let Err(error) =
            self.kvstore.set_keys(area.clone(), params).await
        {
            warn!(%key, %error, "failed to originate prefix database");
        }
    }
}

// ===== impl PrefixManagerHandle =====

impl PrefixManagerHandle {
    pub async fn advertise_prefixes(
        &self,
        entries: Vec<PrefixEntry>,
    ) -> Result<(), Error> {
        self.request(|responder| Command::Advertise {
            entries,
            responder,
        })
        .await?
    }

    pub async fn withdraw_prefixes(
        &self,
        entries: Vec<PrefixEntry>,
    ) -> Result<(), Error> {
        self.request(|responder| Command::Withdraw {
            entries,
            responder,
        })
        .await?
    }

    pub async fn withdraw_prefixes_by_type(
        &self,
        prefix_type: PrefixType,
    ) -> Result<(), Error> {
        self.request(|responder| Command::WithdrawByType {
            prefix_type,
            responder,
        })
        .await?
    }

    pub async fn sync_prefixes_by_type(
        &self,
        prefix_type: PrefixType,
        entries: Vec<PrefixEntry>,
    ) -> Result<(), Error> {
        self.request(|responder| Command::SyncByType {
            prefix_type,
            entries,
            responder,
        })
        .await?
    }

    pub async fn get_prefixes(&self) -> Result<Vec<PrefixEntry>, Error> {
        self.request(|responder| Command::GetAll { responder }).await
    }

    pub async fn get_prefixes_by_type(
        &self,
        prefix_type: PrefixType,
    ) -> Result<Vec<PrefixEntry>, Error> {
        self.request(|responder| Command::GetByType {
            prefix_type,
            responder,
        })
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

// Prefix manager errors.
#[derive(Debug)]
pub enum Error {
    // A withdrawn prefix wasn't advertised.
    NotFound,
    // The prefix manager task is gone.
    TaskShutDown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound => {
                write!(f, "prefix not found")
            }
            Error::TaskShutDown => {
                write!(f, "prefix manager task is not running")
            }
        }
    }
}

impl std::error::Error for Error {}
