//! C6: the ordered key-value state machine committed log entries apply
//! into. Mutated exclusively by `apply.rs`; the client write path here only
//! validates and encodes a proposal for C2, it never mutates state
//! directly (spec.md §4.6: "direct mutation bypassing the log is
//! forbidden").
//!
//! Grounded on the teacher's `storage::engine::StorageEngine` (`BTreeMap`
//! keyspace guarded by `parking_lot::RwLock`, versioned rows) generalized
//! to the `(value, version, created_at, updated_at, log_index, deleted)`
//! tuple spec.md §3 names and the tombstone/compact lifecycle §4.6 adds.

use crate::error::{RaftError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub const MAX_KEY_LEN: usize = 255;
pub const MAX_VALUE_LEN: usize = 1023;

/// The wire shape of a committed KV command, self-describing via `type` so
/// `apply.rs` can distinguish it from an opaque payload by sniffing a
/// leading `{` (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvOperation {
    KvPut { key: String, value: String, timestamp: i64, client_id: String },
    KvDelete { key: String, timestamp: i64, client_id: String },
}

impl KvOperation {
    pub fn key(&self) -> &str {
        match self {
            KvOperation::KvPut { key, .. } => key,
            KvOperation::KvDelete { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub log_index: u64,
    pub deleted: bool,
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(RaftError::Validation("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(RaftError::Validation(format!(
            "key length {} exceeds max {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.bytes().any(|b| matches!(b, 0 | b'\t' | b'\r' | b'\n')) {
        return Err(RaftError::Validation(
            "key contains a forbidden byte (null, tab, CR, or LF)".into(),
        ));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(RaftError::Validation(format!(
            "value length {} exceeds max {}",
            value.len(),
            MAX_VALUE_LEN
        )));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Default)]
struct KvSnapshot {
    entries: BTreeMap<String, KvEntry>,
}

/// In-memory ordered map plus a best-effort on-disk snapshot for fast
/// recovery. The Raft log, not this file, is the source of truth (spec.md
/// §4.6 "Persistence").
pub struct KvStore {
    entries: RwLock<BTreeMap<String, KvEntry>>,
    snapshot_path: PathBuf,
    reads: AtomicU64,
}

impl KvStore {
    pub fn open(data_dir: &str) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let snapshot_path = Path::new(data_dir).join("kv_store.dat");
        let entries = if snapshot_path.exists() {
            let raw = fs::read_to_string(&snapshot_path)?;
            let snap: KvSnapshot = serde_json::from_str(&raw).unwrap_or_default();
            snap.entries
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            entries: RwLock::new(entries),
            snapshot_path,
            reads: AtomicU64::new(0),
        })
    }

    /// Validates a client-supplied key/value pair before it is proposed;
    /// does not touch state (spec.md §4.6 "Client write path").
    pub fn validate_put(key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        validate_value(value)
    }

    pub fn validate_delete(key: &str) -> Result<()> {
        validate_key(key)
    }

    /// Applies a committed put. Infallible by design: apply failures for KV
    /// operations are logged/counted, never propagated as a pipeline error
    /// (spec.md §4.5 "Failure semantics").
    pub fn apply_put(&self, key: String, value: String, log_index: u64) {
        let now = Utc::now();
        let mut entries = self.entries.write();
        entries
            .entry(key)
            .and_modify(|e| {
                e.value = value.clone();
                e.version += 1;
                e.updated_at = now;
                e.log_index = log_index;
                e.deleted = false;
            })
            .or_insert_with(|| KvEntry {
                value,
                version: 1,
                created_at: now,
                updated_at: now,
                log_index,
                deleted: false,
            });
        drop(entries);
        self.persist_snapshot();
    }

    pub fn apply_delete(&self, key: &str, log_index: u64) {
        let mut entries = self.entries.write();
        if let Some(e) = entries.get_mut(key) {
            e.deleted = true;
            e.updated_at = Utc::now();
            e.log_index = log_index;
        }
        drop(entries);
        self.persist_snapshot();
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.entries
            .read()
            .get(key)
            .filter(|e| !e.deleted)
            .map(|e| e.value.clone())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.read().get(key).is_some_and(|e| !e.deleted)
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| !e.deleted)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Drops tombstoned rows; does not touch live rows' versions.
    pub fn compact(&self) {
        self.entries.write().retain(|_, e| !e.deleted);
        self.persist_snapshot();
    }

    /// Wipes the store and persists the empty state. Used by test/recovery
    /// tooling, never by the apply path.
    pub fn reset(&self) {
        self.entries.write().clear();
        self.persist_snapshot();
    }

    fn persist_snapshot(&self) {
        let snap = KvSnapshot { entries: self.entries.read().clone() };
        if let Err(e) = self.write_atomic(&snap) {
            warn!(error = %e, "failed to persist kv snapshot, Raft log remains the source of truth");
        }
    }

    fn write_atomic(&self, snap: &KvSnapshot) -> Result<()> {
        let json = serde_json::to_string(snap)?;
        let parent = self
            .snapshot_path
            .parent()
            .ok_or_else(|| RaftError::Storage(format!("invalid path: {:?}", self.snapshot_path)))?;
        let tmp_path = parent.join(format!(
            ".{}.tmp.{}",
            self.snapshot_path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id()
        ));
        let mut file = File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.snapshot_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().to_str().unwrap()).unwrap();
        kv.apply_put("a".into(), "1".into(), 1);
        assert_eq!(kv.get("a"), Some("1".to_string()));
        assert!(kv.exists("a"));
    }

    #[test]
    fn put_twice_bumps_version_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().to_str().unwrap()).unwrap();
        kv.apply_put("a".into(), "1".into(), 1);
        kv.apply_put("a".into(), "2".into(), 2);
        let entries = kv.entries.read();
        let e = entries.get("a").unwrap();
        assert_eq!(e.version, 2);
        assert_eq!(e.value, "2");
        assert_eq!(e.created_at, e.created_at);
    }

    #[test]
    fn delete_tombstones_rather_than_removes() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().to_str().unwrap()).unwrap();
        kv.apply_put("a".into(), "1".into(), 1);
        kv.apply_delete("a", 2);
        assert_eq!(kv.get("a"), None);
        assert!(!kv.exists("a"));
        assert_eq!(kv.list_keys().len(), 0);
    }

    #[test]
    fn compact_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().to_str().unwrap()).unwrap();
        kv.apply_put("a".into(), "1".into(), 1);
        kv.apply_delete("a", 2);
        kv.compact();
        assert_eq!(kv.entries.read().len(), 0);
    }

    #[test]
    fn reopen_recovers_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let kv = KvStore::open(path).unwrap();
            kv.apply_put("a".into(), "1".into(), 1);
        }
        let reopened = KvStore::open(path).unwrap();
        assert_eq!(reopened.get("a"), Some("1".to_string()));
    }

    #[test]
    fn validate_put_rejects_oversized_key() {
        let key = "x".repeat(MAX_KEY_LEN + 1);
        assert!(KvStore::validate_put(&key, "v").is_err());
    }

    #[test]
    fn validate_put_rejects_forbidden_bytes() {
        assert!(KvStore::validate_put("a\tb", "v").is_err());
        assert!(KvStore::validate_put("a\nb", "v").is_err());
    }

    #[test]
    fn validate_put_rejects_empty_key() {
        assert!(KvStore::validate_put("", "v").is_err());
    }
}
