//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::Error;

// Length of the blake3 checksum suffix on every record.
const CHECKSUM_LEN: usize = 8;

// The log is compacted once it carries this many records beyond the live
// key count.
const COMPACTION_SLACK: usize = 1024;

// One entry of the on-disk record log. Framing is
// `[u32 BE payload len][bincode payload][8-byte blake3 of payload]`;
// a torn or corrupt tail record terminates replay.
#[derive(Debug, Deserialize, Serialize)]
enum LogRecord {
    Set { key: String, value: Vec<u8> },
    Erase { key: String },
}

/// In-memory cache over the append-only record log.
#[derive(Debug)]
pub(crate) struct ConfigDb {
    path: PathBuf,
    file: File,
    cache: BTreeMap<String, Bytes>,
    // Records appended since the last compaction.
    log_records: usize,
}

// ===== impl ConfigDb =====

impl ConfigDb {
    pub(crate) async fn open(path: PathBuf) -> Result<ConfigDb, Error> {
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                vec![]
            }
            Err(error) => return Err(Error::Io(error)),
        };
        let (cache, log_records) = replay(&data);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(Error::Io)?;

        debug!(path = %path.display(), keys = cache.len(), "log replayed");
        Ok(ConfigDb {
            path,
            file,
            cache,
            log_records,
        })
    }

    pub(crate) async fn set(
        &mut self,
        key: String,
        value: Bytes,
    ) -> Result<(), Error> {
        let record = LogRecord::Set {
            key: key.clone(),
            value: value.to_vec(),
        };
        self.append(&record).await?;
        self.cache.insert(key, value);
        Ok(())
    }

    pub(crate) fn get(&self, key: &str) -> Result<Bytes, Error> {
        self.cache
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    pub(crate) async fn erase(&mut self, key: &str) -> Result<(), Error> {
        if self.cache.remove(key).is_none() {
            return Err(Error::NotFound(key.to_owned()));
        }
        let record = LogRecord::Erase {
            key: key.to_owned(),
        };
        self.append(&record).await
    }

    // Rewrites the log with only live records once enough dead ones have
    // accumulated.
    pub(crate) async fn maybe_compact(&mut self) -> Result<(), Error> {
        if self.log_records <= self.cache.len() + COMPACTION_SLACK {
            return Ok(());
        }

        debug!(
            records = self.log_records,
            keys = self.cache.len(),
            "compacting record log"
        );

        let mut data = vec![];
        for (key, value) in &self.cache {
            let record = LogRecord::Set {
                key: key.clone(),
                value: value.to_vec(),
            };
            data.extend_from_slice(&encode_record(&record)?);
        }

        // Write the replacement log aside, then atomically swap it in.
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).await.map_err(Error::Io)?;
        tmp.write_all(&data).await.map_err(Error::Io)?;
        tmp.sync_data().await.map_err(Error::Io)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(Error::Io)?;

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(Error::Io)?;
        self.log_records = self.cache.len();
        Ok(())
    }

    async fn append(&mut self, record: &LogRecord) -> Result<(), Error> {
        let frame = encode_record(record)?;
        self.file.write_all(&frame).await.map_err(Error::Io)?;
        // Acknowledge only once the record is on disk.
        self.file.sync_data().await.map_err(Error::Io)?;
        self.log_records += 1;
        Ok(())
    }
}

// ===== helper functions =====

fn encode_record(record: &LogRecord) -> Result<Vec<u8>, Error> {
    let payload =
        bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(Error::RecordEncode)?;

    let mut frame =
        Vec::with_capacity(4 + payload.len() + CHECKSUM_LEN);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload));
    Ok(frame)
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = blake3::hash(payload);
    let mut checksum = [0; CHECKSUM_LEN];
    checksum.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    checksum
}

// Replays the record log, applying records in order. Replay stops at the
// first torn or corrupt record; everything before it is preserved.
fn replay(data: &[u8]) -> (BTreeMap<String, Bytes>, usize) {
    let mut cache = BTreeMap::new();
    let mut log_records = 0;
    let mut offset = 0;

    while data.len() - offset >= 4 {
        let len = u32::from_be_bytes(
            data[offset..offset + 4].try_into().unwrap(),
        ) as usize;
        let end = offset + 4 + len + CHECKSUM_LEN;
        if end > data.len() {
            warn!("truncated record at log tail, discarding");
            break;
        }

        let payload = &data[offset + 4..offset + 4 + len];
        let stored_checksum = &data[offset + 4 + len..end];
        if checksum(payload) != stored_checksum {
            warn!("corrupt record at log tail, discarding");
            break;
        }

        let record = match bincode::serde::decode_from_slice::<LogRecord, _>(
            payload,
            bincode::config::standard(),
        ) {
            Ok((record, _)) => record,
            Err(_) => {
                warn!("undecodable record at log tail, discarding");
                break;
            }
        };

        match record {
            LogRecord::Set { key, value } => {
                cache.insert(key, Bytes::from(value));
            }
            LogRecord::Erase { key } => {
                cache.remove(&key);
            }
        }
        log_records += 1;
        offset = end;
    }

    (cache, log_records)
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        (dir, path)
    }

    #[tokio::test]
    async fn set_get_erase() {
        let (_dir, path) = tmp_store_path();
        let mut db = ConfigDb::open(path).await.unwrap();

        db.set("k2".to_owned(), Bytes::from_static(b"v2"))
            .await
            .unwrap();
        assert_eq!(db.get("k2").unwrap(), Bytes::from_static(b"v2"));

        assert!(matches!(db.get("k1"), Err(Error::NotFound(_))));
        assert!(matches!(db.erase("k1").await, Err(Error::NotFound(_))));

        db.erase("k2").await.unwrap();
        assert!(matches!(db.get("k2"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let (_dir, path) = tmp_store_path();

        {
            let mut db = ConfigDb::open(path.clone()).await.unwrap();
            db.set("k1".to_owned(), Bytes::from_static(b"v1"))
                .await
                .unwrap();
            db.set("k2".to_owned(), Bytes::from_static(b"v2"))
                .await
                .unwrap();
            db.erase("k1").await.unwrap();
        }

        let db = ConfigDb::open(path).await.unwrap();
        assert!(matches!(db.get("k1"), Err(Error::NotFound(_))));
        assert_eq!(db.get("k2").unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn torn_write_discards_tail() {
        let (_dir, path) = tmp_store_path();

        {
            let mut db = ConfigDb::open(path.clone()).await.unwrap();
            db.set("k1".to_owned(), Bytes::from_static(b"v1"))
                .await
                .unwrap();
        }

        // Simulate a crash mid-append: a length prefix with half a
        // payload behind it.
        let mut data = tokio::fs::read(&path).await.unwrap();
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(b"partial");
        tokio::fs::write(&path, &data).await.unwrap();

        let db = ConfigDb::open(path).await.unwrap();
        assert_eq!(db.get("k1").unwrap(), Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn corrupt_checksum_discards_tail() {
        let (_dir, path) = tmp_store_path();

        {
            let mut db = ConfigDb::open(path.clone()).await.unwrap();
            db.set("k1".to_owned(), Bytes::from_static(b"v1"))
                .await
                .unwrap();
            db.set("k2".to_owned(), Bytes::from_static(b"v2"))
                .await
                .unwrap();
        }

        // Flip one bit in the last record's checksum.
        let mut data = tokio::fs::read(&path).await.unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        tokio::fs::write(&path, &data).await.unwrap();

        let db = ConfigDb::open(path).await.unwrap();
        assert_eq!(db.get("k1").unwrap(), Bytes::from_static(b"v1"));
        assert!(matches!(db.get("k2"), Err(Error::NotFound(_))));
    }
}
