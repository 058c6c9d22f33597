//! Durable Raft storage: combined `{hard_state, entries, snapshot}` blob
//! per node, written tmp+rename, mirrored in memory so reads never block on
//! disk. Grounded on the teacher's `metadata.rs::write_file_atomic` for the
//! persistence mechanics and the pack's Raft storage crates for the
//! log-specific shape (checksum-per-entry, gap/overlap rules).

use crate::error::{RaftError, Result};
use crate::raft::types::{ConfState, HardState, LogEntry, LogIndex, Snapshot, Term};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::warn;

/// On-disk combined state blob. Entries carry a CRC32 checksum computed at
/// append time and verified on load; this is a durability concern, not a
/// wire concern, so it lives only here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedBlob {
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    entries: Vec<ChecksummedEntry>,
    #[serde(default)]
    applied_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChecksummedEntry {
    entry: LogEntry,
    crc32: u32,
}

impl ChecksummedEntry {
    fn new(entry: LogEntry) -> Self {
        let crc32 = crc32fast::hash(&entry.data);
        Self { entry, crc32 }
    }

    fn verify(&self) -> bool {
        crc32fast::hash(&self.entry.data) == self.crc32
    }
}

/// Trait exposed to the rest of the engine. A generic engine could hold any
/// implementor; in practice this crate only ships `FileStorage`.
pub trait Storage: Send + Sync {
    fn initial_state(&self) -> Result<(HardState, ConfState)>;
    fn first_index(&self) -> LogIndex;
    fn last_index(&self) -> LogIndex;
    fn term(&self, index: LogIndex) -> Option<Term>;
    fn entries(&self, lo: LogIndex, hi: LogIndex, max_bytes: Option<usize>) -> Result<Vec<LogEntry>>;
    fn append(&self, entries: &[LogEntry]) -> Result<()>;
    fn set_hard_state(&self, hs: HardState) -> Result<()>;
    fn apply_snapshot(&self, snap: Snapshot) -> Result<()>;
    fn compact(&self, index: LogIndex) -> Result<()>;
    fn snapshot(&self) -> Option<Snapshot>;
    fn persistence_failure_count(&self) -> u64;
    fn last_persistence_error(&self) -> Option<String>;
    fn applied_index(&self) -> LogIndex;
    /// Rejects a regression: `spec.md` §7 treats an attempted `applied_index`
    /// regression as a fatal invariant violation.
    fn set_applied_index(&self, index: LogIndex) -> Result<()>;
}

struct MemView {
    hard_state: HardState,
    /// `entries[i]` has index `first_index() + i`. `first_index` comes from
    /// either 1 or the index right after the latest snapshot.
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    applied_index: LogIndex,
}

impl MemView {
    fn first_index(&self) -> LogIndex {
        self.snapshot.as_ref().map(|s| s.metadata.index + 1).unwrap_or(1)
    }

    fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot.as_ref().map(|s| s.metadata.index).unwrap_or(0))
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        let first = self.first_index();
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }
}

/// Per-node file-backed storage. Guards its in-memory view with a
/// `parking_lot::RwLock`; writers hold it for the duration of the mutation,
/// readers take a shared lock (snapshot queries over immutable clones avoid
/// holding the lock across I/O, per spec.md §5's shared-resource policy).
pub struct FileStorage {
    path: PathBuf,
    view: RwLock<MemView>,
    failure_count: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_persist_time: RwLock<Option<SystemTime>>,
}

impl FileStorage {
    /// Opens (or creates) the state file under `data_dir/node_<raft_id>_state.json`.
    /// A torn/corrupt trailing record is dropped with a warning; corruption
    /// earlier in the log is a fatal startup error per spec.md §7.
    pub fn open(data_dir: &str, raft_id: u64) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = Path::new(data_dir).join(format!("node_{}_state.json", raft_id));

        let blob = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            PersistedBlob::default()
        };

        let mut entries: Vec<LogEntry> = Vec::with_capacity(blob.entries.len());
        for (i, ce) in blob.entries.iter().enumerate() {
            if ce.verify() {
                entries.push(ce.entry.clone());
            } else if i + 1 == blob.entries.len() {
                warn!(path = %path.display(), "dropping corrupt trailing log entry on load");
            } else {
                return Err(RaftError::Fatal(format!(
                    "checksum mismatch at non-trailing entry index {} in {}",
                    ce.entry.index,
                    path.display()
                )));
            }
        }

        let mut hard_state = blob.hard_state;
        let last_entry_index = entries.last().map(|e| e.index).unwrap_or_else(|| {
            blob.snapshot.as_ref().map(|s| s.metadata.index).unwrap_or(0)
        });
        if hard_state.commit > last_entry_index {
            warn!(
                commit = hard_state.commit,
                last_entry_index, "HardState.commit exceeds last log index on load, clamping"
            );
            hard_state.commit = last_entry_index;
        }

        Ok(Self {
            path,
            view: RwLock::new(MemView {
                hard_state,
                entries,
                snapshot: blob.snapshot,
                applied_index: blob.applied_index,
            }),
            failure_count: AtomicU64::new(0),
            last_error: RwLock::new(None),
            last_persist_time: RwLock::new(None),
        })
    }

    /// Serialises the combined view and persists it tmp+rename. Failures are
    /// counted and surfaced but never returned as a hard error to the
    /// caller — the in-memory mutation has already succeeded, per spec.md
    /// §4.1 Failure semantics ("reads never block writes").
    fn persist(&self, view: &MemView) {
        let blob = PersistedBlob {
            hard_state: view.hard_state.clone(),
            snapshot: view.snapshot.clone(),
            entries: view
                .entries
                .iter()
                .cloned()
                .map(ChecksummedEntry::new)
                .collect(),
            applied_index: view.applied_index,
        };

        if let Err(e) = self.write_atomic(&blob) {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            *self.last_error.write() = Some(e.to_string());
            warn!(error = %e, "raft storage persistence failed, continuing with in-memory state");
        } else {
            *self.last_persist_time.write() = Some(SystemTime::now());
        }
    }

    fn write_atomic(&self, blob: &PersistedBlob) -> Result<()> {
        let json = serde_json::to_string(blob)?;
        let parent = self
            .path
            .parent()
            .ok_or_else(|| RaftError::Storage(format!("invalid path: {:?}", self.path)))?;
        let tmp_path = parent.join(format!(
            ".{}.tmp.{}",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id()
        ));

        let mut file = File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn initial_state(&self) -> Result<(HardState, ConfState)> {
        let view = self.view.read();
        let conf_state = view
            .snapshot
            .as_ref()
            .map(|s| s.metadata.conf_state.clone())
            .unwrap_or_default();
        Ok((view.hard_state.clone(), conf_state))
    }

    fn first_index(&self) -> LogIndex {
        self.view.read().first_index()
    }

    fn last_index(&self) -> LogIndex {
        self.view.read().last_index()
    }

    fn term(&self, index: LogIndex) -> Option<Term> {
        let view = self.view.read();
        if index == 0 {
            return Some(0);
        }
        if let Some(snap) = &view.snapshot {
            if index == snap.metadata.index {
                return Some(snap.metadata.term);
            }
        }
        view.entry_at(index).map(|e| e.term)
    }

    fn entries(&self, lo: LogIndex, hi: LogIndex, max_bytes: Option<usize>) -> Result<Vec<LogEntry>> {
        let view = self.view.read();
        if lo < view.first_index() {
            return Err(RaftError::Storage(format!(
                "requested entries from {} but first available index is {}",
                lo,
                view.first_index()
            )));
        }
        let mut out = Vec::new();
        let mut size = 0usize;
        for index in lo..hi {
            let Some(entry) = view.entry_at(index) else {
                break;
            };
            if let Some(max) = max_bytes {
                if size + entry.data.len() > max && !out.is_empty() {
                    break;
                }
            }
            size += entry.data.len();
            out.push(entry.clone());
        }
        Ok(out)
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut view = self.view.write();
        let start = entries[0].index;
        let last = view.last_index();

        if start > last + 1 {
            return Err(RaftError::Storage(format!(
                "append with gap: start={} but last_index={}",
                start, last
            )));
        }

        // Overlapping indices truncate the conflicting suffix: "leader wins".
        if start <= last {
            let first = view.first_index();
            if start >= first {
                view.entries.truncate((start - first) as usize);
            } else {
                view.entries.clear();
            }
        }
        view.entries.extend(entries.iter().cloned());
        self.persist(&view);
        Ok(())
    }

    fn set_hard_state(&self, hs: HardState) -> Result<()> {
        let mut view = self.view.write();
        if hs.commit > view.last_index() {
            return Err(RaftError::Storage(format!(
                "HardState.commit {} exceeds last_index {}; entries must be persisted first",
                hs.commit,
                view.last_index()
            )));
        }
        view.hard_state = hs;
        self.persist(&view);
        Ok(())
    }

    fn apply_snapshot(&self, snap: Snapshot) -> Result<()> {
        let mut view = self.view.write();
        if snap.metadata.index <= view.snapshot.as_ref().map(|s| s.metadata.index).unwrap_or(0) {
            return Ok(());
        }
        view.entries.retain(|e| e.index > snap.metadata.index);
        if view.hard_state.commit < snap.metadata.index {
            view.hard_state.commit = snap.metadata.index;
        }
        view.snapshot = Some(snap);
        self.persist(&view);
        Ok(())
    }

    fn compact(&self, index: LogIndex) -> Result<()> {
        let mut view = self.view.write();
        let first = view.first_index();
        if index < first {
            return Ok(());
        }
        view.entries.retain(|e| e.index > index);
        self.persist(&view);
        Ok(())
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.view.read().snapshot.clone()
    }

    fn persistence_failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    fn last_persistence_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn applied_index(&self) -> LogIndex {
        self.view.read().applied_index
    }

    fn set_applied_index(&self, index: LogIndex) -> Result<()> {
        let mut view = self.view.write();
        if index < view.applied_index {
            return Err(RaftError::Fatal(format!(
                "applied_index regression: {} -> {}",
                view.applied_index, index
            )));
        }
        view.applied_index = index;
        self.persist(&view);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::EntryType;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(term, index, EntryType::Normal, b"x".to_vec())
    }

    #[test]
    fn append_rejects_gap() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().to_str().unwrap(), 1).unwrap();
        let err = storage.append(&[entry(2, 1)]).unwrap_err();
        assert!(matches!(err, RaftError::Storage(_)));
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().to_str().unwrap(), 1).unwrap();
        storage.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        storage.append(&[entry(2, 2)]).unwrap();
        assert_eq!(storage.last_index(), 2);
        assert_eq!(storage.term(2), Some(2));
    }

    #[test]
    fn hard_state_commit_cannot_exceed_last_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().to_str().unwrap(), 1).unwrap();
        storage.append(&[entry(1, 1)]).unwrap();
        let err = storage
            .set_hard_state(HardState { term: 1, vote: None, commit: 5 })
            .unwrap_err();
        assert!(matches!(err, RaftError::Storage(_)));
    }

    #[test]
    fn reload_clamps_commit_exceeding_last_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let storage = FileStorage::open(path, 1).unwrap();
            storage.append(&[entry(1, 1), entry(2, 1)]).unwrap();
            storage
                .set_hard_state(HardState { term: 1, vote: None, commit: 2 })
                .unwrap();
        }
        // Simulate external corruption: commit beyond what's now on disk.
        let state_path = Path::new(path).join("node_1_state.json");
        let mut blob: PersistedBlob =
            serde_json::from_str(&fs::read_to_string(&state_path).unwrap()).unwrap();
        blob.hard_state.commit = 10;
        fs::write(&state_path, serde_json::to_string(&blob).unwrap()).unwrap();

        let reopened = FileStorage::open(path, 1).unwrap();
        assert_eq!(reopened.initial_state().unwrap().0.commit, 2);
    }

    #[test]
    fn applied_index_rejects_regression() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().to_str().unwrap(), 1).unwrap();
        storage.set_applied_index(5).unwrap();
        let err = storage.set_applied_index(3).unwrap_err();
        assert!(matches!(err, RaftError::Fatal(_)));
        assert_eq!(storage.applied_index(), 5);
    }

    #[test]
    fn applied_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let storage = FileStorage::open(path, 1).unwrap();
            storage.set_applied_index(3).unwrap();
        }
        let reopened = FileStorage::open(path, 1).unwrap();
        assert_eq!(reopened.applied_index(), 3);
    }

    #[test]
    fn reopen_recovers_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let storage = FileStorage::open(path, 7).unwrap();
            storage.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        }
        let reopened = FileStorage::open(path, 7).unwrap();
        assert_eq!(reopened.last_index(), 2);
        assert_eq!(reopened.entries(1, 3, None).unwrap().len(), 2);
    }
}
