//! Durable record set for a single shard.
//!
//! The store keeps every record in memory for lookups and appends each accepted write
//! to `node_<port>.log` as `"<key> <value>\n"`. The log is the source of truth across
//! restarts and is replayed in file order when the store is opened.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, error, info};

use crate::{Key, error::StoreError, protocol::Request};

/// Result of a single write against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    DuplicateKey,
}

/// Steps of an append that tests can force to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultPoint {
    Sync,
    Rollback,
}

/// Log file name a node listening on `port` writes to.
pub fn log_file_name(port: u16) -> String {
    format!("node_{port}.log")
}

/// A shard's records plus the open handle to its append-only log.
///
/// The store is owned by exactly one server. Callers that share it across tasks wrap
/// it in a mutex so the duplicate check and the append happen as one step.
pub struct NodeStore {
    records: HashMap<Key, String>,
    log: File,
    path: PathBuf,
    /// Set when a failed append could not be undone. The log tail is then unknown and
    /// no further writes are taken until the node restarts and replays it.
    failed: bool,
    #[cfg(test)]
    faults: Vec<FaultPoint>,
}

impl NodeStore {
    /// Replays the log at `path` (if any) and opens it for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = load(&path).await?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), records = records.len(), "node log replayed");
        Ok(Self {
            records,
            log,
            path,
            failed: false,
            #[cfg(test)]
            faults: Vec::new(),
        })
    }

    /// Stores `value` under `key` unless the key already exists.
    ///
    /// The record is appended and synced to the log before it becomes visible in
    /// memory. If the append fails the log is truncated back to its previous length,
    /// the error is returned and the key stays absent, so a write is never acknowledged
    /// without being durable. If the truncation fails as well, every later put is
    /// refused with [`StoreError::Io`].
    pub async fn put(&mut self, key: Key, value: String) -> Result<PutOutcome, StoreError> {
        if self.failed {
            return Err(StoreError::Io {
                path: self.path.clone(),
                source: io::Error::other(
                    "log tail is in an unknown state after a failed append; restart to replay it",
                ),
            });
        }
        if self.records.contains_key(&key) {
            debug!(key, "rejecting duplicate key");
            return Ok(PutOutcome::Rejected(Rejection::DuplicateKey));
        }

        let record = Request::new(key, value)?;
        self.append(&record).await.map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(key, "record stored");
        self.records.insert(record.key, record.value);
        Ok(PutOutcome::Accepted)
    }

    async fn append(&mut self, record: &Request) -> io::Result<()> {
        let len = self.log.metadata().await?.len();
        let Err(err) = self.write_record(record).await else {
            return Ok(());
        };

        if let Err(rollback) = self.truncate(len).await {
            error!(
                path = %self.path.display(),
                error = %rollback,
                "failed to roll back partial append; refusing further writes"
            );
            self.failed = true;
        }
        Err(err)
    }

    async fn write_record(&mut self, record: &Request) -> io::Result<()> {
        let mut line = record.encode();
        line.push('\n');
        self.log.write_all(line.as_bytes()).await?;
        self.log.flush().await?;
        self.fault(FaultPoint::Sync)?;
        self.log.sync_data().await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.fault(FaultPoint::Rollback)?;
        self.log.set_len(len).await?;
        self.log.sync_data().await
    }

    #[cfg(test)]
    fn fault(&self, point: FaultPoint) -> io::Result<()> {
        if self.faults.contains(&point) {
            return Err(io::Error::other(format!("injected {point:?} failure")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn fault(&self, _point: FaultPoint) -> io::Result<()> {
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, point: FaultPoint) {
        self.faults.push(point);
    }

    pub fn get(&self, key: Key) -> Option<&str> {
        self.records.get(&key).map(String::as_str)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.records.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Rebuilds the record map from the log at `path`.
///
/// A missing file is an empty shard. A line that does not parse, or a key that shows
/// up twice, means the log was corrupted and is reported instead of being repaired.
pub async fn load(path: &Path) -> Result<HashMap<Key, String>, StoreError> {
    let mut records = HashMap::new();

    let file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0;
    while let Some(line) = lines.next_line().await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record = Request::parse(&line).map_err(|reason| StoreError::CorruptLog {
            path: path.to_path_buf(),
            line: line_no,
            reason,
        })?;

        if records.contains_key(&record.key) {
            return Err(StoreError::DuplicateOnReplay {
                key: record.key,
                line: line_no,
            });
        }
        records.insert(record.key, record.value);
    }

    Ok(records)
}
