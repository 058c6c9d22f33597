//! The facade named in `spec.md` §9's re-architecture guidance: a single
//! `Engine` value owns storage, state machine, transport, and driver, and
//! exposes exactly the control surface `spec.md` §6 specifies. Nothing
//! outside this module touches `raft::node::RaftNode` directly.
//!
//! Grounded on the teacher's `clustering::ClusterManager` (one struct
//! owning the membership list, the raft handle, and the network pool,
//! with `init`/`start`/`shutdown` lifecycle methods).

use crate::apply::ApplyPipeline;
use crate::config::Config;
use crate::driver::{Driver, DriverHandle, TICK_MS};
use crate::error::{RaftError, Result};
use crate::kv::{KvOperation, KvStore};
use crate::observer::Observer;
use crate::raft::node::RaftNode;
use crate::raft::types::{ConfChange, ConfChangeOp, ConfState, LogIndex, RaftNodeId, Term};
use crate::storage::{FileStorage, Storage};
use crate::transport::PeerTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

struct Running {
    driver_handle: DriverHandle,
    transport: PeerTransport,
    stop_tx: watch::Sender<bool>,
    join_handle: tokio::task::JoinHandle<()>,
}

/// Owns every component and is the only type an embedder interacts with
/// (spec.md §6 "Control surface").
pub struct Engine {
    config: Config,
    node_id: RaftNodeId,
    storage: Arc<dyn Storage>,
    kv: Arc<KvStore>,
    observer: Arc<Observer>,
    running: Option<Running>,
}

impl Engine {
    /// Opens durable state and constructs the in-memory state machine, but
    /// does not start the Ready loop or transport yet — matches spec.md
    /// §6 `init(config)` being distinct from `start()`.
    pub fn init(config: Config) -> Result<Self> {
        config.validate().map_err(RaftError::Validation)?;
        let node_id = config.local_raft_id();
        if node_id == 0 {
            return Err(RaftError::Validation(format!(
                "name '{}' not found in initial_cluster",
                config.name
            )));
        }

        let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&config.data_dir, node_id)?);
        let kv = Arc::new(KvStore::open(&config.data_dir)?);
        let observer = Arc::new(Observer::new(&config, node_id));

        info!(
            node_id,
            name = %config.name,
            state = ?config.initial_cluster_state,
            "engine initialized"
        );

        Ok(Self { config, node_id, storage, kv, observer, running: None })
    }

    /// Reconstructs the Raft state machine from durable storage. No
    /// `Snapshot` is ever self-originated by this crate (see `DESIGN.md`),
    /// so a persisted `ConfState` only exists if one arrived via an inbound
    /// `InstallSnapshot`; on the far more common restart path there is
    /// none, and the true current membership is recovered by replaying
    /// every `ConfChange`/`ConfChangeV2` entry in the persisted log onto
    /// the bootstrap position-derived roster, independent of
    /// `applied_index` (`raft::membership::replay_conf_state`).
    fn build_node(&self) -> Result<RaftNode> {
        let (hard_state, stored_conf_state) = self.storage.initial_state()?;

        let first = self.storage.first_index();
        let last = self.storage.last_index();
        let log = if last >= first { self.storage.entries(first, last + 1, None)? } else { Vec::new() };
        let snapshot = self.storage.snapshot();

        let conf_state = if !stored_conf_state.voters.is_empty() {
            stored_conf_state
        } else {
            let base = ConfState::new((1..=self.config.initial_cluster.len() as u64).collect());
            crate::raft::membership::replay_conf_state(base, &log, hard_state.commit)
        };

        let election_ticks = (self.config.election_timeout_ms / TICK_MS).max(1);
        let heartbeat_ticks = (self.config.heartbeat_interval_ms / TICK_MS).max(1);

        Ok(RaftNode::new(
            self.node_id,
            hard_state,
            conf_state,
            log,
            snapshot.as_ref(),
            election_ticks,
            heartbeat_ticks,
        ))
    }

    /// Begins the Ready loop and peer transport. Idempotent-unsafe by
    /// design: calling twice without an intervening `stop()` is a misuse
    /// the embedder is responsible for avoiding, matching spec.md's
    /// control surface (no explicit "already started" error is named).
    pub async fn start(&mut self) -> Result<()> {
        let node = self.build_node()?;

        let peers: HashMap<RaftNodeId, String> = self
            .config
            .initial_cluster
            .iter()
            .enumerate()
            .map(|(i, m)| ((i + 1) as RaftNodeId, m.addr()))
            .filter(|(id, _)| *id != self.node_id)
            .collect();
        let listen_addr = format!("{}:{}", self.config.listen_peer_host, self.config.listen_peer_port);

        let peer_handle = PeerTransport::start(self.node_id, listen_addr, peers).await?;
        let apply = ApplyPipeline::new(self.kv.clone(), self.storage.clone(), self.observer.clone());

        let driver = Arc::new(Driver::new(
            node,
            self.storage.clone(),
            peer_handle.transport.clone(),
            apply,
            self.observer.clone(),
            self.node_id,
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let (driver_handle, join_handle) =
            driver.spawn(peer_handle.inbound, self.config.propose_timeout(), stop_rx);

        self.running = Some(Running {
            driver_handle,
            transport: peer_handle.transport,
            stop_tx,
            join_handle,
        });

        info!(node_id = self.node_id, "engine started");
        Ok(())
    }

    /// Orderly shutdown: signals the driver to drain one final Ready, then
    /// tears down transport (spec.md §6 `stop()`).
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(true);
            let _ = running.join_handle.await;
            running.transport.shutdown().await;
            info!(node_id = self.node_id, "engine stopped");
        }
        Ok(())
    }

    fn require_running(&self) -> Result<&Running> {
        self.running
            .as_ref()
            .ok_or_else(|| RaftError::Validation("engine is not started".into()))
    }

    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        self.require_running()?.driver_handle.propose(data).await
    }

    pub async fn propose_conf_change(&self, op: ConfChangeOp, node_id: RaftNodeId, address: Option<String>) -> Result<LogIndex> {
        let cc = ConfChange { op, node_id, address };
        self.require_running()?
            .driver_handle
            .propose_conf_change(cc, self.config.conf_change_max_retries)
            .await
    }

    pub async fn is_leader(&self) -> bool {
        self.observer.is_leader().await
    }

    pub async fn leader_id(&self) -> Option<RaftNodeId> {
        self.observer.leader_id().await
    }

    pub async fn current_term(&self) -> Term {
        self.observer.current_term().await
    }

    pub fn applied_index(&self) -> LogIndex {
        self.storage.applied_index()
    }

    /// Validates, rejects on a follower with the leader hint, and proposes
    /// a `kv_put` entry, then blocks until it has been applied (hence
    /// committed to a quorum) — spec.md §4.6's client write path contract
    /// ("return to caller once committed (or with a timeout error)"), using
    /// the shorter `propose_replication_timeout_ms` budget rather than the
    /// general 30s propose timeout (spec.md §5).
    pub async fn kv_put(&self, key: impl Into<String>, value: impl Into<String>) -> Result<LogIndex> {
        let key = key.into();
        let value = value.into();
        KvStore::validate_put(&key, &value)?;
        if !self.is_leader().await {
            return Err(RaftError::NotLeader { leader_hint: self.leader_id().await });
        }
        let op = KvOperation::KvPut {
            key,
            value,
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_id: uuid::Uuid::new_v4().to_string(),
        };
        self.require_running()?
            .driver_handle
            .propose_and_wait_committed(serde_json::to_vec(&op)?, self.config.propose_replication_timeout())
            .await
    }

    pub async fn kv_delete(&self, key: impl Into<String>) -> Result<LogIndex> {
        let key = key.into();
        KvStore::validate_delete(&key)?;
        if !self.is_leader().await {
            return Err(RaftError::NotLeader { leader_hint: self.leader_id().await });
        }
        let op = KvOperation::KvDelete {
            key,
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_id: uuid::Uuid::new_v4().to_string(),
        };
        self.require_running()?
            .driver_handle
            .propose_and_wait_committed(serde_json::to_vec(&op)?, self.config.propose_replication_timeout())
            .await
    }

    /// Reads are served locally from the applied KV state; spec.md §6 notes
    /// these "internally propose or read locally" — a `get` never goes
    /// through C2.
    pub fn kv_get(&self, key: &str) -> Option<String> {
        self.kv.get(key)
    }

    pub fn kv_exists(&self, key: &str) -> bool {
        self.kv.exists(key)
    }

    pub fn kv_list_keys(&self) -> Vec<String> {
        self.kv.list_keys()
    }
}
