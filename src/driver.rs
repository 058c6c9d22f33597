//! C4: the single-threaded cooperative sequencer that owns the Raft state
//! machine. Runs the external 100 ms tick, drains `Ready` batches in the
//! mandated 5-step order (persist entries, persist hard_state, send
//! messages, apply committed entries, advance), and exposes `propose`/
//! `propose_conf_change` with bounded, retrying timeouts.
//!
//! Grounded on the teacher's `network::cluster_network::RaftLeaderElection`
//! (`election_loop`/`run_as_{follower,candidate,leader}`: a single task
//! owning role-driven behavior on `tokio::time::interval`) — the teacher's
//! loop is a stub with no real AppendEntries; this one completes it into the
//! Ready-batch-driven loop spec.md requires.

use crate::apply::ApplyPipeline;
use crate::error::{RaftError, Result};
use crate::observer::Observer;
use crate::raft::node::RaftNode;
use crate::raft::types::{ConfChange, LogIndex, Message};
use crate::storage::Storage;
use crate::transport::PeerTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::interval;
use tracing::{error, info, warn};

/// External tick period (spec.md §4.4/§5): election/heartbeat timeouts are
/// counted in these ticks, not wall-clock time directly.
pub const TICK_MS: u64 = 100;
const TICK_INTERVAL: Duration = Duration::from_millis(TICK_MS);

enum Command {
    Propose { data: Vec<u8>, reply: oneshot::Sender<Result<LogIndex>> },
    ProposeConfChange { cc: ConfChange, reply: oneshot::Sender<Result<LogIndex>> },
}

/// Handle given to callers (the `Engine` facade and, transitively, `kv.rs`)
/// to submit work to the driver without touching `RaftNode` directly —
/// every mutation to C2's state funnels through the single owning task.
#[derive(Clone)]
pub struct DriverHandle {
    cmd_tx: mpsc::Sender<Command>,
    propose_timeout: Duration,
    applied_rx: watch::Receiver<LogIndex>,
}

impl DriverHandle {
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Propose { data, reply: reply_tx })
            .await
            .map_err(|_| RaftError::Transport("driver task is gone".into()))?;
        tokio::time::timeout(self.propose_timeout, reply_rx)
            .await
            .map_err(|_| RaftError::Timeout("propose timed out".into()))?
            .map_err(|_| RaftError::Transport("driver task dropped reply".into()))?
    }

    /// Proposes and waits until the entry at the returned index has been
    /// applied (hence committed to a quorum) before returning, per spec.md
    /// §4.6's client write path contract ("return to caller once committed
    /// (or with a timeout error)") — distinct from the bare `propose` used
    /// by opaque/non-KV payloads, which returns as soon as C2 accepts it.
    pub async fn propose_and_wait_committed(
        &self,
        data: Vec<u8>,
        replication_timeout: Duration,
    ) -> Result<LogIndex> {
        let index = self.propose(data).await?;
        let mut applied_rx = self.applied_rx.clone();
        if *applied_rx.borrow() >= index {
            return Ok(index);
        }
        tokio::time::timeout(replication_timeout, async {
            loop {
                if *applied_rx.borrow() >= index {
                    return;
                }
                if applied_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| RaftError::Timeout("propose timed out waiting for commit".into()))?;
        Ok(index)
    }

    /// Retries up to `max_retries` times with exponential backoff, since a
    /// conf change may be rejected while an earlier one is still in flight
    /// (spec.md §4.4/§7).
    pub async fn propose_conf_change(&self, cc: ConfChange, max_retries: u32) -> Result<LogIndex> {
        let mut attempt = 0;
        loop {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.cmd_tx
                .send(Command::ProposeConfChange { cc: cc.clone(), reply: reply_tx })
                .await
                .map_err(|_| RaftError::Transport("driver task is gone".into()))?;
            let result = tokio::time::timeout(self.propose_timeout, reply_rx)
                .await
                .map_err(|_| RaftError::Timeout("propose_conf_change timed out".into()))?
                .map_err(|_| RaftError::Transport("driver task dropped reply".into()))?;

            match result {
                Err(RaftError::ConfChangeInFlight) if attempt < max_retries => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
                }
                other => return other,
            }
        }
    }
}

/// Owns `RaftNode` exclusively; runs the tick source and the Ready loop.
pub struct Driver {
    node: Mutex<RaftNode>,
    storage: Arc<dyn Storage>,
    transport: PeerTransport,
    apply: ApplyPipeline,
    observer: Arc<Observer>,
    local_id: crate::raft::types::RaftNodeId,
    applied_tx: watch::Sender<LogIndex>,
}

impl Driver {
    pub fn new(
        node: RaftNode,
        storage: Arc<dyn Storage>,
        transport: PeerTransport,
        apply: ApplyPipeline,
        observer: Arc<Observer>,
        local_id: crate::raft::types::RaftNodeId,
    ) -> Self {
        let (applied_tx, _) = watch::channel(storage.applied_index());
        Self {
            node: Mutex::new(node),
            storage,
            transport,
            apply,
            observer,
            local_id,
            applied_tx,
        }
    }

    /// Spawns the tick task and the command/inbound-message processing
    /// loop. Returns a `DriverHandle` for proposing and an inbound sender
    /// for the transport's reader tasks (and the self-addressed bypass) to
    /// feed messages in.
    pub fn spawn(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Message>,
        propose_timeout: Duration,
        mut stop_rx: tokio::sync::watch::Receiver<bool>,
    ) -> (DriverHandle, tokio::task::JoinHandle<()>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1024);
        let applied_rx = self.applied_tx.subscribe();

        let driver = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            driver.drain_final_ready().await;
                            info!("driver shutting down");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        driver.node.lock().await.tick();
                        driver.pump_ready().await;
                    }
                    Some(msg) = inbound.recv() => {
                        driver.node.lock().await.step(msg);
                        driver.pump_ready().await;
                    }
                    Some(cmd) = cmd_rx.recv() => {
                        driver.handle_command(cmd).await;
                        driver.pump_ready().await;
                    }
                }
            }
        });

        (DriverHandle { cmd_tx, propose_timeout, applied_rx }, handle)
    }

    async fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::Propose { data, reply } => {
                let result = self.node.lock().await.propose(data);
                let _ = reply.send(result);
            }
            Command::ProposeConfChange { cc, reply } => {
                let result = self.node.lock().await.propose_conf_change(cc);
                let _ = reply.send(result);
            }
        }
    }

    /// One pump of the Ready loop: persist entries, persist hard_state,
    /// send messages, apply committed entries, advance (spec.md §4.2/§4.4).
    async fn pump_ready(&self) {
        loop {
            let mut node = self.node.lock().await;
            if !node.has_ready() {
                return;
            }
            let ready = node.ready();
            drop(node);

            if !ready.entries.is_empty() {
                if let Err(e) = self.storage.append(&ready.entries) {
                    warn!(error = %e, "failed to persist entries, continuing with in-memory state");
                }
            }
            if let Some(hard_state) = &ready.hard_state {
                if let Err(e) = self.storage.set_hard_state(hard_state.clone()) {
                    warn!(error = %e, "failed to persist hard_state, continuing with in-memory state");
                }
            }
            if let Some(snapshot) = &ready.snapshot {
                if let Err(e) = self.storage.apply_snapshot(snapshot.clone()) {
                    warn!(error = %e, "failed to persist snapshot");
                }
            }

            for msg in ready.messages {
                if msg.to == self.local_id {
                    self.node.lock().await.step(msg);
                } else {
                    self.transport.send(msg).await;
                }
            }

            for entry in &ready.committed_entries {
                let node_arc = &self.node;
                if let Err(e) = self
                    .apply
                    .apply_entry(entry, node_arc, &self.transport)
                    .await
                {
                    if e.is_fatal() {
                        error!(error = %e, "fatal apply failure, crashing node to force resync");
                        std::process::exit(1);
                    } else {
                        warn!(error = %e, "apply failure, continuing");
                    }
                }
            }

            if !ready.committed_entries.is_empty() {
                let _ = self.applied_tx.send(self.storage.applied_index());
            }

            if let Some(hard_state) = &ready.hard_state {
                self.observer.publish_term(hard_state.term).await;
            }
            if let Some(soft_state) = ready.soft_state {
                self.observer.publish_soft_state(soft_state).await;
            }

            self.node.lock().await.advance();

            if self.storage.persistence_failure_count() > 0 {
                self.observer
                    .note_persistence_failure(self.storage.persistence_failure_count());
            }
        }
    }

    async fn drain_final_ready(&self) {
        self.pump_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kv::KvStore;
    use crate::raft::types::{ConfState, HardState};
    use crate::storage::FileStorage;
    use std::collections::HashMap;

    async fn single_node_driver(dir: &std::path::Path) -> (Arc<Driver>, DriverHandle, watch::Sender<bool>) {
        let storage: Arc<dyn Storage> =
            Arc::new(FileStorage::open(dir.to_str().unwrap(), 1).unwrap());
        let kv = Arc::new(KvStore::open(dir.to_str().unwrap()).unwrap());
        let mut cfg = Config::default();
        cfg.data_dir = dir.to_str().unwrap().to_string();
        let observer = Arc::new(Observer::new(&cfg, 1));
        let apply = ApplyPipeline::new(kv, storage.clone(), observer.clone());
        let peer_handle = PeerTransport::start(1, "127.0.0.1:0".into(), HashMap::new())
            .await
            .unwrap();
        let node = RaftNode::new(1, HardState::default(), ConfState::new(vec![1]), Vec::new(), None, 2, 1);
        let driver = Arc::new(Driver::new(node, storage, peer_handle.transport, apply, observer, 1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (handle, _join) = driver.clone().spawn(peer_handle.inbound, Duration::from_secs(1), stop_rx);
        (driver, handle, stop_tx)
    }

    #[tokio::test]
    async fn propose_and_wait_committed_blocks_until_applied() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, handle, stop_tx) = single_node_driver(dir.path()).await;

        // single-voter cluster: campaigns and becomes leader on first tick.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let index = handle
            .propose_and_wait_committed(b"hello".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(index >= 1);

        let _ = stop_tx.send(true);
    }
}
