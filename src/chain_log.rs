//! Append-only, hash-chained event log.
//!
//! Every material state transition in the system is recorded as a
//! [`ChainEntry`]. Each entry's `merkle_root` hashes the entry together with
//! the previous entry's root, so tampering with any historical entry is
//! detectable by [`ChainLog::verify`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::canonical_json::to_canonical_bytes;
use crate::error::{CoreError, CoreResult};

const GENESIS_ROOT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Scalar metadata value. `metadata` on a chain entry is the one remaining
/// free-form field in the data model; this keeps it value-typed rather than
/// reintroducing a dynamic dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<f64> for MetaValue {
    fn from(n: f64) -> Self {
        MetaValue::Number(n)
    }
}

impl From<u64> for MetaValue {
    fn from(n: u64) -> Self {
        MetaValue::Number(n as f64)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// One entry in the hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub metadata: Metadata,
    pub prev_root: String,
    pub merkle_root: String,
}

/// The hashed, pre-root portion of an entry: what gets fed into the hash
/// together with `prev_root` to produce `merkle_root`.
#[derive(Serialize)]
struct UnrootedEntry<'a> {
    timestamp: DateTime<Utc>,
    event: &'a str,
    metadata: &'a Metadata,
    prev_root: &'a str,
}

fn compute_root(unrooted: &UnrootedEntry<'_>) -> CoreResult<String> {
    let mut bytes = to_canonical_bytes(unrooted)?;
    bytes.push(b'|');
    bytes.extend_from_slice(unrooted.prev_root.as_bytes());
    let mut hasher = Sha3_256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

struct ChainState {
    entries: Vec<ChainEntry>,
    current_root: String,
}

/// Append-only Merkle-chain log, durable to a JSON-lines file on disk.
pub struct ChainLog {
    path: PathBuf,
    state: Mutex<ChainState>,
}

impl ChainLog {
    /// Open (or create) the chain log at `path`, replaying any existing
    /// entries. If the file cannot be parsed, start from an empty chain
    /// rather than failing startup — the genesis entry logged immediately
    /// after records the recovery.
    pub async fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (entries, current_root, recovered) = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match parse_existing(&contents) {
                Ok((entries, root)) => (entries, root, false),
                Err(_) => (Vec::new(), GENESIS_ROOT.to_string(), true),
            },
            Err(_) => (Vec::new(), GENESIS_ROOT.to_string(), false),
        };

        let log = ChainLog {
            path,
            state: Mutex::new(ChainState {
                entries,
                current_root,
            }),
        };

        if recovered {
            log.append(
                "chain recovery: existing log unparsable, starting fresh",
                Metadata::new(),
            )
            .await?;
        }

        Ok(log)
    }

    /// Append a new entry, durably writing it before updating in-memory
    /// state — a crash between the two would otherwise leave the on-disk
    /// chain shorter than memory believes, breaking later verification.
    #[tracing::instrument(skip(self, event, metadata))]
    pub async fn append(&self, event: impl Into<String>, metadata: Metadata) -> CoreResult<String> {
        let event = event.into();
        tracing::info!(event = %event, "appending chain entry");
        let mut state = self.state.lock().await;

        let unrooted = UnrootedEntry {
            timestamp: Utc::now(),
            event: &event,
            metadata: &metadata,
            prev_root: &state.current_root,
        };
        let merkle_root = compute_root(&unrooted)?;

        let entry = ChainEntry {
            timestamp: unrooted.timestamp,
            event,
            metadata,
            prev_root: state.current_root.clone(),
            merkle_root: merkle_root.clone(),
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        write_line(&self.path, &line).await?;

        state.entries.push(entry);
        state.current_root = merkle_root.clone();
        Ok(merkle_root)
    }

    /// Recompute every root from genesis and compare against what is stored.
    /// Returns `Ok(())` if the chain is intact, or `CoreError::ChainIntegrityError`
    /// naming the first index where recomputation diverges.
    #[tracing::instrument(skip(self))]
    pub async fn verify(&self) -> CoreResult<()> {
        let state = self.state.lock().await;
        let mut prev_root = GENESIS_ROOT.to_string();
        for (i, entry) in state.entries.iter().enumerate() {
            if entry.prev_root != prev_root {
                tracing::error!(at_index = i, "chain integrity check failed: prev_root mismatch");
                return Err(CoreError::ChainIntegrityError { at_index: i });
            }
            let unrooted = UnrootedEntry {
                timestamp: entry.timestamp,
                event: &entry.event,
                metadata: &entry.metadata,
                prev_root: &entry.prev_root,
            };
            let recomputed = compute_root(&unrooted)?;
            if recomputed != entry.merkle_root {
                tracing::error!(at_index = i, "chain integrity check failed: merkle_root mismatch");
                return Err(CoreError::ChainIntegrityError { at_index: i });
            }
            prev_root = entry.merkle_root.clone();
        }
        Ok(())
    }

    pub async fn current_root(&self) -> String {
        self.state.lock().await.current_root.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Most recent `n` entries, oldest first.
    pub async fn tail(&self, n: usize) -> Vec<ChainEntry> {
        let state = self.state.lock().await;
        let len = state.entries.len();
        let start = len.saturating_sub(n);
        state.entries[start..].to_vec()
    }
}

fn parse_existing(contents: &str) -> Result<(Vec<ChainEntry>, String), ()> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: ChainEntry = serde_json::from_str(line).map_err(|_| ())?;
        entries.push(entry);
    }
    let root = entries
        .last()
        .map(|e| e.merkle_root.clone())
        .unwrap_or_else(|| GENESIS_ROOT.to_string());
    Ok((entries, root))
}

async fn write_line(path: &Path, line: &str) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::ChainWriteError(e.to_string()))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| CoreError::ChainWriteError(e.to_string()))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| CoreError::ChainWriteError(e.to_string()))?;
    file.flush()
        .await
        .map_err(|e| CoreError::ChainWriteError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn genesis_entry_links_to_fixed_root() {
        let dir = TempDir::new().unwrap();
        let log = ChainLog::open(dir.path().join("chain.log")).await.unwrap();
        log.append("first event", Metadata::new()).await.unwrap();
        let tail = log.tail(1).await;
        assert_eq!(tail[0].prev_root, GENESIS_ROOT);
    }

    #[tokio::test]
    async fn each_entry_links_to_previous_root() {
        let dir = TempDir::new().unwrap();
        let log = ChainLog::open(dir.path().join("chain.log")).await.unwrap();
        log.append("a", Metadata::new()).await.unwrap();
        log.append("b", Metadata::new()).await.unwrap();
        log.append("c", Metadata::new()).await.unwrap();
        let tail = log.tail(3).await;
        assert_eq!(tail[1].prev_root, tail[0].merkle_root);
        assert_eq!(tail[2].prev_root, tail[1].merkle_root);
    }

    #[tokio::test]
    async fn verify_passes_on_untouched_chain() {
        let dir = TempDir::new().unwrap();
        let log = ChainLog::open(dir.path().join("chain.log")).await.unwrap();
        for i in 0..5 {
            log.append(format!("event {i}"), Metadata::new())
                .await
                .unwrap();
        }
        assert!(log.verify().await.is_ok());
    }

    #[tokio::test]
    async fn verify_fails_after_tampering() {
        let dir = TempDir::new().unwrap();
        let log = ChainLog::open(dir.path().join("chain.log")).await.unwrap();
        log.append("a", Metadata::new()).await.unwrap();
        log.append("b", Metadata::new()).await.unwrap();
        log.append("c", Metadata::new()).await.unwrap();
        {
            let mut state = log.state.lock().await;
            state.entries[1].event = "tampered".to_string();
        }
        let result = log.verify().await;
        assert!(matches!(
            result,
            Err(CoreError::ChainIntegrityError { at_index: 1 })
        ));
    }

    #[tokio::test]
    async fn reopening_replays_prior_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.log");
        {
            let log = ChainLog::open(&path).await.unwrap();
            log.append("persisted", Metadata::new()).await.unwrap();
        }
        let reopened = ChainLog::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.verify().await.is_ok());
    }
}
