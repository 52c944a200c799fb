//! File-backed vector memory index.
//!
//! Layout inside the index directory:
//!
//! - `records.jsonl`: append-only operation log, one JSON object per line
//!   (`{"op":"upsert","record":{..}}` or `{"op":"forget_user",..}`).
//! - `snapshot.json`: every record as of a log byte offset, with a SHA-256
//!   checksum over the serialized records and a SHA-256 digest of the log
//!   bytes it covers.
//!
//! Opening loads the snapshot and replays the log tail behind it. A snapshot
//! that is missing, corrupt, checksum-mismatched, ahead of the log or taken
//! from a different log (the digest of the covered prefix differs) is ignored
//! and the whole log is replayed instead. Corrupt log lines are skipped with
//! a warning.
//!
//! Search is exact (a linear scan with cosine similarity) and always scoped
//! to one user.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use taskmind_config::MemoryConfig;
use taskmind_core::error::MemoryError;
use taskmind_core::memory::{MemoryIndex, MemoryRecord, ScoredRecord};
use taskmind_core::message::UserId;
use taskmind_core::provider::Embedder;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::vector::rank_records;

const LOG_FILE: &str = "records.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_VERSION: u32 = 2;

/// Tunables for a [`FileVectorIndex`].
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub dimension: usize,
    pub min_score: f32,
    /// Automatic checkpoint after this many upserts (0 disables)
    pub snapshot_every: usize,
    pub compact_on_erase: bool,
}

impl IndexOptions {
    pub fn from_config(config: &MemoryConfig, dimension: usize) -> Self {
        Self {
            dimension,
            min_score: config.min_score,
            snapshot_every: config.snapshot_every,
            compact_on_erase: config.compact_on_erase,
        }
    }
}

/// Counters reported by `taskmind memory stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub live: usize,
    pub tombstoned: usize,
    pub dimension: usize,
    pub log_bytes: u64,
    pub snapshot_offset: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Upsert {
        record: MemoryRecord,
    },
    ForgetUser {
        user_id: UserId,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dimension: usize,
    log_offset: u64,
    /// SHA-256 of `records.jsonl[..log_offset]`
    log_digest: String,
    checksum: String,
    records: Vec<MemoryRecord>,
}

#[derive(Default)]
struct IndexState {
    /// Insertion order is preserved so snapshots and compaction are stable.
    records: Vec<MemoryRecord>,
    by_id: HashMap<String, usize>,
    log_len: u64,
    /// Running digest of every log byte written so far.
    log_hasher: Sha256,
    snapshot_offset: Option<u64>,
    upserts_since_snapshot: usize,
}

impl IndexState {
    fn insert(&mut self, record: MemoryRecord) -> bool {
        if self.by_id.contains_key(&record.id) {
            return false;
        }
        self.by_id.insert(record.id.clone(), self.records.len());
        self.records.push(record);
        true
    }

    fn tombstone_user(&mut self, user_id: &UserId, at: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for record in self.records.iter_mut() {
            if record.user_id == *user_id && record.deleted_at.is_none() {
                record.deleted_at = Some(at);
                removed += 1;
            }
        }
        removed
    }

    fn apply(&mut self, entry: LogEntry, dimension: usize) {
        match entry {
            LogEntry::Upsert { record } => {
                if record.embedding.len() != dimension {
                    warn!(id = %record.id, len = record.embedding.len(), "Skipping record with wrong dimension");
                    return;
                }
                self.insert(record);
            }
            LogEntry::ForgetUser { user_id, at } => {
                self.tombstone_user(&user_id, at);
            }
        }
    }

    fn live(&self) -> usize {
        self.records.iter().filter(|r| !r.is_deleted()).count()
    }
}

/// Persistent, user-scoped nearest-neighbour index.
pub struct FileVectorIndex {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    options: IndexOptions,
    state: RwLock<IndexState>,
}

impl FileVectorIndex {
    /// Open (or create) the index stored in `dir`.
    pub fn open(
        dir: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        options: IndexOptions,
    ) -> Result<Self, MemoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| MemoryError::Storage(format!("Failed to create index directory: {e}")))?;

        if embedder.dimension() != options.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: options.dimension,
                actual: embedder.dimension(),
            });
        }

        let state = Self::recover(&dir, options.dimension)?;
        info!(
            path = %dir.display(),
            live = state.live(),
            total = state.records.len(),
            "Vector memory index opened"
        );

        Ok(Self {
            dir,
            embedder,
            options,
            state: RwLock::new(state),
        })
    }

    fn log_path(dir: &Path) -> PathBuf {
        dir.join(LOG_FILE)
    }

    fn snapshot_path(dir: &Path) -> PathBuf {
        dir.join(SNAPSHOT_FILE)
    }

    fn recover(dir: &Path, dimension: usize) -> Result<IndexState, MemoryError> {
        let log_path = Self::log_path(dir);
        let mut log = match fs::read(&log_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(MemoryError::Storage(format!("Failed to read memory log: {e}"))),
        };

        // A torn final write leaves no newline; terminate it so the next
        // append starts on a fresh line.
        if log.last().is_some_and(|b| *b != b'\n') {
            warn!("Memory log ends with a partial line");
            let mut file = OpenOptions::new()
                .append(true)
                .open(&log_path)
                .map_err(|e| MemoryError::Storage(format!("Failed to open memory log: {e}")))?;
            file.write_all(b"\n")
                .map_err(|e| MemoryError::Storage(format!("Failed to repair memory log: {e}")))?;
            log.push(b'\n');
        }

        let mut state = IndexState::default();
        let mut start = 0usize;

        match Self::load_snapshot(dir, dimension, &log) {
            Some(snapshot) => {
                debug!(offset = snapshot.log_offset, records = snapshot.records.len(), "Loaded snapshot");
                start = snapshot.log_offset as usize;
                state.snapshot_offset = Some(snapshot.log_offset);
                for record in snapshot.records {
                    state.insert(record);
                }
            }
            None => debug!("Rebuilding index from the full log"),
        }

        let tail = String::from_utf8_lossy(&log[start..]);
        for line in tail.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => state.apply(entry, dimension),
                Err(e) => warn!(error = %e, "Skipping corrupted memory log line"),
            }
        }

        state.log_len = log.len() as u64;
        state.log_hasher.update(&log);
        Ok(state)
    }

    fn load_snapshot(dir: &Path, dimension: usize, log: &[u8]) -> Option<Snapshot> {
        let log_len = log.len() as u64;
        let content = fs::read_to_string(Self::snapshot_path(dir)).ok()?;
        let snapshot: Snapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable snapshot");
                return None;
            }
        };
        if snapshot.version != SNAPSHOT_VERSION || snapshot.dimension != dimension {
            warn!(version = snapshot.version, dimension = snapshot.dimension, "Ignoring incompatible snapshot");
            return None;
        }
        if snapshot.log_offset > log_len {
            warn!(offset = snapshot.log_offset, log_len, "Ignoring snapshot ahead of the log");
            return None;
        }
        let covered = &log[..snapshot.log_offset as usize];
        if digest_hex(covered) != snapshot.log_digest {
            warn!(offset = snapshot.log_offset, "Ignoring snapshot taken from a different log");
            return None;
        }
        match checksum(&snapshot.records) {
            Ok(sum) if sum == snapshot.checksum => Some(snapshot),
            _ => {
                warn!("Ignoring snapshot with checksum mismatch");
                None
            }
        }
    }

    fn append_log(&self, state: &mut IndexState, entry: &LogEntry) -> Result<(), MemoryError> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize log entry: {e}")))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::log_path(&self.dir))
            .map_err(|e| MemoryError::Storage(format!("Failed to open memory log: {e}")))?;
        file.write_all(line.as_bytes())
            .map_err(|e| MemoryError::Storage(format!("Failed to append to memory log: {e}")))?;

        state.log_len += line.len() as u64;
        state.log_hasher.update(line.as_bytes());
        Ok(())
    }

    fn write_snapshot(&self, state: &mut IndexState) -> Result<(), MemoryError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            dimension: self.options.dimension,
            log_offset: state.log_len,
            log_digest: format!("{:x}", state.log_hasher.clone().finalize()),
            checksum: checksum(&state.records)?,
            records: state.records.clone(),
        };
        let content = serde_json::to_vec(&snapshot)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize snapshot: {e}")))?;
        replace_file(&Self::snapshot_path(&self.dir), &content)?;

        state.snapshot_offset = Some(state.log_len);
        state.upserts_since_snapshot = 0;
        debug!(offset = state.log_len, records = state.records.len(), "Snapshot written");
        Ok(())
    }

    /// Write a fresh snapshot covering the whole log.
    pub async fn checkpoint(&self) -> Result<(), MemoryError> {
        let mut state = self.state.write().await;
        self.write_snapshot(&mut state)
    }

    /// Physically drop tombstoned records, rewriting log and snapshot.
    ///
    /// Returns the number of records erased.
    pub async fn compact(&self) -> Result<usize, MemoryError> {
        let mut state = self.state.write().await;
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut IndexState) -> Result<usize, MemoryError> {
        let before = state.records.len();
        let live: Vec<MemoryRecord> = state.records.drain(..).filter(|r| !r.is_deleted()).collect();
        let removed = before - live.len();

        let mut content = String::new();
        for record in &live {
            let line = serde_json::to_string(&LogEntry::Upsert { record: record.clone() })
                .map_err(|e| MemoryError::Storage(format!("Failed to serialize log entry: {e}")))?;
            content.push_str(&line);
            content.push('\n');
        }
        // The old snapshot describes the old log; it must not outlive it.
        match fs::remove_file(Self::snapshot_path(&self.dir)) {
            Ok(()) => state.snapshot_offset = None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MemoryError::Storage(format!("Failed to remove snapshot: {e}"))),
        }
        replace_file(&Self::log_path(&self.dir), content.as_bytes())?;

        state.by_id.clear();
        for record in live {
            state.insert(record);
        }
        state.log_len = content.len() as u64;
        state.log_hasher = Sha256::new();
        state.log_hasher.update(content.as_bytes());
        self.write_snapshot(state)?;

        info!(removed, live = state.records.len(), "Memory index compacted");
        Ok(removed)
    }

    pub async fn stats(&self) -> IndexStats {
        let state = self.state.read().await;
        let live = state.live();
        IndexStats {
            live,
            tombstoned: state.records.len() - live,
            dimension: self.options.dimension,
            log_bytes: state.log_len,
            snapshot_offset: state.snapshot_offset,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_dimension(&self, len: usize) -> Result<(), MemoryError> {
        if len != self.options.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.options.dimension,
                actual: len,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryIndex for FileVectorIndex {
    fn name(&self) -> &str {
        "file"
    }

    async fn upsert(&self, mut record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        if let Some(existing) = self.get(&record.id).await? {
            return Ok(existing);
        }

        if record.embedding.is_empty() {
            record.embedding = self
                .embedder
                .embed(&record.text)
                .await
                .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;
        }
        self.check_dimension(record.embedding.len())?;

        let mut state = self.state.write().await;
        // Lost a race with an upsert of the same id
        if let Some(&pos) = state.by_id.get(&record.id) {
            return Ok(state.records[pos].clone());
        }

        self.append_log(&mut state, &LogEntry::Upsert { record: record.clone() })?;
        state.insert(record.clone());
        state.upserts_since_snapshot += 1;

        if self.options.snapshot_every > 0 && state.upserts_since_snapshot >= self.options.snapshot_every {
            if let Err(e) = self.write_snapshot(&mut state) {
                warn!(error = %e, "Automatic checkpoint failed");
            }
        }

        debug!(id = %record.id, user = %record.user_id, "Memory record stored");
        Ok(record)
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        user_id: &UserId,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        self.check_dimension(embedding.len())?;
        let state = self.state.read().await;
        Ok(rank_records(&state.records, embedding, k, self.options.min_score, user_id))
    }

    async fn remove_user(&self, user_id: &UserId) -> Result<usize, MemoryError> {
        let mut state = self.state.write().await;
        let live = state
            .records
            .iter()
            .filter(|r| r.user_id == *user_id && !r.is_deleted())
            .count();
        if live == 0 {
            return Ok(0);
        }

        let at = Utc::now();
        self.append_log(
            &mut state,
            &LogEntry::ForgetUser {
                user_id: user_id.clone(),
                at,
            },
        )?;
        let removed = state.tombstone_user(user_id, at);
        info!(user = %user_id, removed, "User memories erased");

        if self.options.compact_on_erase {
            self.compact_locked(&mut state)?;
        }
        Ok(removed)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let state = self.state.read().await;
        Ok(state.by_id.get(id).map(|&pos| state.records[pos].clone()))
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.state.read().await.live())
    }
}

fn checksum(records: &[MemoryRecord]) -> Result<String, MemoryError> {
    let bytes = serde_json::to_vec(records)
        .map_err(|e| MemoryError::Storage(format!("Failed to serialize records: {e}")))?;
    Ok(digest_hex(&bytes))
}

fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write `content` next to `path` and rename it into place.
fn replace_file(path: &Path, content: &[u8]) -> Result<(), MemoryError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .map_err(|e| MemoryError::Storage(format!("Failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| MemoryError::Storage(format!("Failed to replace {}: {e}", path.display())))
}
