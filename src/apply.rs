//! C5: dispatches committed log entries into the KV state machine,
//! membership state, or an external hook, enforcing the exactly-once
//! watermark and the fatal/non-fatal failure split spec.md §4.5 requires.
//!
//! Grounded on the teacher's `clustering::raft::RaftNode::apply_committed_entries`
//! shape (iterate, match on entry kind, advance an applied-index counter),
//! generalized to this crate's `KvOperation` payload sniffing and the
//! apply-time-only ConfChange semantics `raft::membership` implements.

use crate::error::Result;
use crate::kv::{KvOperation, KvStore};
use crate::observer::Observer;
use crate::raft::node::RaftNode;
use crate::raft::types::{ConfChange, ConfChangeOp, EntryType, LogEntry};
use crate::storage::Storage;
use crate::transport::PeerTransport;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Invoked for any `Normal` entry whose payload does not parse as a
/// `KvOperation` (does not start with `{`, or fails to deserialize) —
/// the seam spec.md §4.5/§6 calls "delivered to an external hook" without
/// specifying its shape.
pub type ExternalHook = dyn Fn(&LogEntry) + Send + Sync;

fn default_hook(entry: &LogEntry) {
    debug!(index = entry.index, len = entry.data.len(), "opaque entry delivered to default no-op hook");
}

pub struct ApplyPipeline {
    kv: Arc<KvStore>,
    storage: Arc<dyn Storage>,
    observer: Arc<Observer>,
    hook: Arc<ExternalHook>,
}

impl ApplyPipeline {
    pub fn new(kv: Arc<KvStore>, storage: Arc<dyn Storage>, observer: Arc<Observer>) -> Self {
        Self { kv, storage, observer, hook: Arc::new(default_hook) }
    }

    pub fn with_hook(
        kv: Arc<KvStore>,
        storage: Arc<dyn Storage>,
        observer: Arc<Observer>,
        hook: Arc<ExternalHook>,
    ) -> Self {
        Self { kv, storage, observer, hook }
    }

    /// Applies one committed entry. `node` is locked only for the
    /// ConfChange path, which must mutate `RaftNode`'s membership state;
    /// KV operations never touch it.
    pub async fn apply_entry(
        &self,
        entry: &LogEntry,
        node: &Mutex<RaftNode>,
        transport: &PeerTransport,
    ) -> Result<()> {
        if entry.index <= self.storage.applied_index() {
            debug!(index = entry.index, applied_index = self.storage.applied_index(), "skipping already-applied entry");
            return Ok(());
        }

        match entry.entry_type {
            EntryType::Normal => self.apply_normal(entry),
            EntryType::ConfChange | EntryType::ConfChangeV2 => {
                self.apply_conf_change(entry, node, transport).await?;
            }
        }

        self.storage.set_applied_index(entry.index)
    }

    fn apply_normal(&self, entry: &LogEntry) {
        if entry.is_empty_barrier() {
            return;
        }

        if entry.data.first() == Some(&b'{') {
            match serde_json::from_slice::<KvOperation>(&entry.data) {
                Ok(KvOperation::KvPut { key, value, .. }) => {
                    self.kv.apply_put(key, value, entry.index);
                }
                Ok(KvOperation::KvDelete { key, .. }) => {
                    self.kv.apply_delete(&key, entry.index);
                }
                Err(e) => {
                    warn!(index = entry.index, error = %e, "entry looked like a KV op but failed to parse, treating as opaque");
                    (self.hook)(entry);
                }
            }
        } else {
            (self.hook)(entry);
        }
    }

    async fn apply_conf_change(
        &self,
        entry: &LogEntry,
        node: &Mutex<RaftNode>,
        transport: &PeerTransport,
    ) -> Result<()> {
        let cc: ConfChange = serde_json::from_slice(&entry.data)?;

        let result = {
            let mut n = node.lock().await;
            n.apply_conf_change(entry.index, &cc)
        };

        if let Err(e) = &result {
            error!(index = entry.index, error = %e, "ConfChange apply failed, this is fatal");
            return result;
        }

        match (cc.op, &cc.address) {
            (ConfChangeOp::AddVoter, Some(addr)) | (ConfChangeOp::AddLearner, Some(addr)) => {
                transport.add_peer(cc.node_id, addr.clone()).await;
                self.observer.add_node(cc.node_id, addr.clone()).await;
            }
            (ConfChangeOp::RemoveNode, _) => {
                transport.remove_peer(cc.node_id).await;
                self.observer.remove_node(cc.node_id).await;
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{ConfState, HardState};
    use std::collections::HashMap;

    async fn pipeline_and_node() -> (ApplyPipeline, Mutex<RaftNode>, PeerTransport) {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(crate::storage::FileStorage::open(dir.path().to_str().unwrap(), 1).unwrap());
        let kv = Arc::new(KvStore::open(dir.path().to_str().unwrap()).unwrap());
        let mut cfg = crate::config::Config::default();
        cfg.data_dir = dir.path().to_str().unwrap().to_string();
        let observer = Arc::new(Observer::new(&cfg, 1));
        let pipeline = ApplyPipeline::new(kv, storage, observer);
        let node = Mutex::new(RaftNode::new(1, HardState::default(), ConfState::new(vec![1]), Vec::new(), None, 10, 1));
        let handle = crate::transport::PeerTransport::start(1, "127.0.0.1:0".into(), HashMap::new())
            .await
            .unwrap();
        (pipeline, node, handle.transport)
    }

    #[tokio::test]
    async fn applies_kv_put_and_advances_applied_index() {
        let (pipeline, node, transport) = pipeline_and_node().await;
        let payload = serde_json::to_vec(&KvOperation::KvPut {
            key: "a".into(),
            value: "1".into(),
            timestamp: 0,
            client_id: "c1".into(),
        })
        .unwrap();
        let entry = LogEntry::new(1, 1, EntryType::Normal, payload);
        pipeline.apply_entry(&entry, &node, &transport).await.unwrap();
        assert_eq!(pipeline.kv.get("a"), Some("1".to_string()));
        assert_eq!(pipeline.storage.applied_index(), 1);
    }

    #[tokio::test]
    async fn skips_entries_at_or_below_applied_index() {
        let (pipeline, node, transport) = pipeline_and_node().await;
        pipeline.storage.set_applied_index(5).unwrap();
        let payload = serde_json::to_vec(&KvOperation::KvPut {
            key: "a".into(),
            value: "1".into(),
            timestamp: 0,
            client_id: "c1".into(),
        })
        .unwrap();
        let entry = LogEntry::new(1, 3, EntryType::Normal, payload);
        pipeline.apply_entry(&entry, &node, &transport).await.unwrap();
        assert_eq!(pipeline.kv.get("a"), None);
    }

    #[tokio::test]
    async fn empty_barrier_entry_is_a_no_op() {
        let (pipeline, node, transport) = pipeline_and_node().await;
        let entry = LogEntry::new(1, 1, EntryType::Normal, Vec::new());
        pipeline.apply_entry(&entry, &node, &transport).await.unwrap();
        assert_eq!(pipeline.storage.applied_index(), 1);
        assert!(pipeline.kv.list_keys().is_empty());
    }

    #[tokio::test]
    async fn conf_change_removing_last_voter_is_fatal() {
        let (pipeline, node, transport) = pipeline_and_node().await;
        let cc = ConfChange { op: ConfChangeOp::RemoveNode, node_id: 1, address: None };
        let payload = serde_json::to_vec(&cc).unwrap();
        let entry = LogEntry::new(1, 1, EntryType::ConfChange, payload);
        let err = pipeline.apply_entry(&entry, &node, &transport).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn conf_change_add_voter_updates_conf_state() {
        let (pipeline, node, transport) = pipeline_and_node().await;
        let cc = ConfChange { op: ConfChangeOp::AddVoter, node_id: 2, address: Some("127.0.0.1:9999".into()) };
        let payload = serde_json::to_vec(&cc).unwrap();
        let entry = LogEntry::new(1, 1, EntryType::ConfChange, payload);
        pipeline.apply_entry(&entry, &node, &transport).await.unwrap();
        assert!(node.lock().await.conf_state().contains_voter(2));
    }
}
