//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod error;
mod log;

pub use error::Error;

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use lattice_utils::task::Task;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, Instrument};

use crate::log::ConfigDb;

// How often the record log is checked for compaction.
const COMPACTION_INTERVAL: Duration = Duration::from_secs(60);

// Requests accepted by the config store task.
#[derive(Debug)]
enum Command {
    Set {
        key: String,
        value: Bytes,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    Get {
        key: String,
        responder: oneshot::Sender<Result<Bytes, Error>>,
    },
    Erase {
        key: String,
        responder: oneshot::Sender<Result<(), Error>>,
    },
}

/// Client handle to a running config store task.
#[derive(Clone, Debug)]
pub struct ConfigStoreHandle {
    cmd_tx: Sender<Command>,
}

/// Durable {key -> bytes} map backed by an append-only record log.
///
/// Writes are acknowledged only after the log has been flushed to disk.
/// The log is compacted periodically once dead records accumulate.
pub struct ConfigStore {
    db: ConfigDb,
    cmd_rx: Receiver<Command>,
}

// ===== impl ConfigStore =====

impl ConfigStore {
    /// Opens (or creates) the store at `path` and spawns its task.
    pub async fn spawn(
        path: PathBuf,
    ) -> Result<(ConfigStoreHandle, Task<()>), Error> {
        let db = ConfigDb::open(path).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let store = ConfigStore { db, cmd_rx };
        let task = Task::spawn(
            store.run().instrument(debug_span!("config-store")),
        );

        Ok((ConfigStoreHandle { cmd_tx }, task))
    }

    async fn run(mut self) {
        let mut compaction =
            tokio::time::interval(COMPACTION_INTERVAL);
        compaction
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // All handles are gone.
                        break;
                    };
                    self.process_command(cmd).await;
                }
                _ = compaction.tick() => {
                    if let Err(error) = self.db.maybe_compact().await {
                        error.log();
                    }
                }
            }
        }
    }

    async fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::Set {
                key,
                value,
                responder,
            } => {
                debug!(%key, "set config key");
                let result = self.db.set(key, value).await;
                let _ = responder.send(result);
            }
            Command::Get { key, responder } => {
                let result = self.db.get(&key);
                let _ = responder.send(result);
            }
            Command::Erase { key, responder } => {
                debug!(%key, "erase config key");
                let result = self.db.erase(&key).await;
                let _ = responder.send(result);
            }
        }
    }
}

// ===== impl ConfigStoreHandle =====

impl ConfigStoreHandle {
    pub async fn set_config_key(
        &self,
        key: String,
        value: Bytes,
    ) -> Result<(), Error> {
        let (responder, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Set {
                key,
                value,
                responder,
            })
            .await
            .map_err(|_| Error::StoreShutDown)?;
        response.await.map_err(|_| Error::StoreShutDown)?
    }

    pub async fn get_config_key(&self, key: String) -> Result<Bytes, Error> {
        let (responder, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get { key, responder })
            .await
            .map_err(|_| Error::StoreShutDown)?;
        response.await.map_err(|_| Error::StoreShutDown)?
    }

    pub async fn erase_config_key(&self, key: String) -> Result<(), Error> {
        let (responder, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Erase { key, responder })
            .await
            .map_err(|_| Error::StoreShutDown)?;
        response.await.map_err(|_| Error::StoreShutDown)?
    }
}
