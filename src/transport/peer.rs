//! The connection table: one TCP link per peer, a listener task, a
//! reconnect scheduler with bounded exponential backoff, and a reader task
//! per connection that hands decoded messages to the driver's inbound
//! queue without running any application logic itself (spec.md §4.3).
//!
//! Grounded on the teacher's `network/server.rs` accept loop (bind, accept,
//! spawn-per-connection) and `network/cluster_network.rs`'s
//! `NodeConnectionPool` (`RwLock<HashMap<NodeId, Connection>>`, per-message
//! `tracing` lifecycle logs) adapted from the teacher's ad-hoc retry-on-error
//! sleep into the specified deduplicated per-peer backoff ladder.

use crate::error::Result;
use crate::raft::types::{Message, RaftNodeId};
use crate::transport::codec::{read_frame, read_handshake, write_frame, write_handshake};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Backoff ladder from spec.md §4.3/§5: 500, 1000, 1500 ms, then capped at
/// 5 s for all subsequent attempts.
const RECONNECT_BACKOFF_MS: [u64; 3] = [500, 1000, 1500];
const RECONNECT_BACKOFF_CAP_MS: u64 = 5000;
const READ_DEADLINE: Duration = Duration::from_secs(2);
const INBOUND_QUEUE_SIZE: usize = 4096;

struct Connection {
    write_half: AsyncMutex<OwnedWriteHalf>,
    reader_task: JoinHandle<()>,
}

/// Cheaply cloneable facade over the connection table; every clone shares
/// the same maps and background tasks via `Arc`.
#[derive(Clone)]
pub struct PeerTransport {
    local_id: RaftNodeId,
    addrs: Arc<AsyncRwLock<HashMap<RaftNodeId, String>>>,
    connections: Arc<AsyncRwLock<HashMap<RaftNodeId, Arc<Connection>>>>,
    inbound_tx: mpsc::Sender<Message>,
    reconnecting: Arc<std::sync::Mutex<HashSet<RaftNodeId>>>,
    reconnect_tx: mpsc::UnboundedSender<RaftNodeId>,
    stop_tx: watch::Sender<bool>,
}

/// Returned from `PeerTransport::start`: the transport facade plus the
/// channel the driver drains inbound messages from.
pub struct PeerHandle {
    pub transport: PeerTransport,
    pub inbound: mpsc::Receiver<Message>,
}

impl PeerTransport {
    pub async fn start(
        local_id: RaftNodeId,
        listen_addr: String,
        peers: HashMap<RaftNodeId, String>,
    ) -> Result<PeerHandle> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let transport = PeerTransport {
            local_id,
            addrs: Arc::new(AsyncRwLock::new(peers.clone())),
            connections: Arc::new(AsyncRwLock::new(HashMap::new())),
            inbound_tx,
            reconnecting: Arc::new(std::sync::Mutex::new(HashSet::new())),
            reconnect_tx,
            stop_tx,
        };

        transport.clone().spawn_listener(listen_addr, stop_rx.clone());
        transport.clone().spawn_reconnect_scheduler(reconnect_rx, stop_rx.clone());

        for &id in peers.keys() {
            transport.schedule_reconnect(id);
        }

        Ok(PeerHandle { transport, inbound: inbound_rx })
    }

    /// Adds (or updates the address of) a peer — called by the apply
    /// pipeline when a ConfChange adds a voter or learner.
    pub async fn add_peer(&self, id: RaftNodeId, addr: String) {
        self.addrs.write().await.insert(id, addr);
        self.schedule_reconnect(id);
    }

    /// Drops a peer's address and closes its connection — called on
    /// ConfChange removal.
    pub async fn remove_peer(&self, id: RaftNodeId) {
        self.addrs.write().await.remove(&id);
        if let Some(conn) = self.connections.write().await.remove(&id) {
            conn.reader_task.abort();
        }
    }

    /// Looks up the connection for `msg.to` and writes one frame. A
    /// missing or broken connection drops the message (Raft will
    /// retransmit) and schedules a reconnect; per spec.md this is never
    /// surfaced to the caller.
    pub async fn send(&self, msg: Message) {
        let to = msg.to;
        let conn = self.connections.read().await.get(&to).cloned();
        let Some(conn) = conn else {
            self.schedule_reconnect(to);
            return;
        };

        let mut write_half = conn.write_half.lock().await;
        if let Err(e) = write_frame(&mut write_half, &msg).await {
            warn!(peer = to, error = %e, "write to peer failed, dropping connection");
            drop(write_half);
            self.connections.write().await.remove(&to);
            conn.reader_task.abort();
            self.schedule_reconnect(to);
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let mut conns = self.connections.write().await;
        for (_, conn) in conns.drain() {
            conn.reader_task.abort();
        }
    }

    fn schedule_reconnect(&self, id: RaftNodeId) {
        if id == self.local_id {
            return;
        }
        let mut set = self.reconnecting.lock().unwrap();
        if set.insert(id) {
            let _ = self.reconnect_tx.send(id);
        }
    }

    fn spawn_listener(self, listen_addr: String, mut stop_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let listener = match TcpListener::bind(&listen_addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(addr = %listen_addr, error = %e, "peer transport failed to bind, listener task exiting");
                    return;
                }
            };
            info!(addr = %listen_addr, "peer transport listening");

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("peer listener shutting down");
                            return;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => self.clone().handle_accepted(stream, addr.to_string()),
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                }
            }
        });
    }

    fn handle_accepted(self, mut stream: TcpStream, remote_addr: String) {
        tokio::spawn(async move {
            let remote_id = match read_handshake(&mut stream).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(addr = %remote_addr, error = %e, "handshake read failed");
                    return;
                }
            };

            let known = self.addrs.read().await.contains_key(&remote_id);
            if !known {
                warn!(remote_id, addr = %remote_addr, "rejecting connection from id outside initial_cluster");
                return;
            }

            info!(remote_id, addr = %remote_addr, "accepted peer connection");
            self.register_connection(remote_id, stream).await;
        });
    }

    async fn dial(&self, id: RaftNodeId, addr: String) -> Result<()> {
        let mut stream = TcpStream::connect(&addr).await?;
        write_handshake(&mut stream, self.local_id).await?;
        info!(peer = id, addr = %addr, "dialed peer");
        self.register_connection(id, stream).await;
        Ok(())
    }

    async fn register_connection(&self, id: RaftNodeId, stream: TcpStream) {
        let (mut read_half, write_half) = stream.into_split();
        let inbound_tx = self.inbound_tx.clone();
        let connections = self.connections.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(READ_DEADLINE, read_frame(&mut read_half)).await {
                    Ok(Ok(msg)) => {
                        if inbound_tx.try_send(msg).is_err() {
                            warn!(peer = id, "inbound queue full, dropping message");
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(peer = id, error = %e, "peer read failed, closing connection");
                        connections.write().await.remove(&id);
                        return;
                    }
                    Err(_) => {
                        // Read timeout: just a liveness check point, loop again
                        // unless the connection was dropped from under us.
                        if !connections.read().await.contains_key(&id) {
                            return;
                        }
                    }
                }
            }
        });

        let new_conn = Arc::new(Connection {
            write_half: AsyncMutex::new(write_half),
            reader_task,
        });
        let old = self.connections.write().await.insert(id, new_conn);
        if let Some(old) = old {
            old.reader_task.abort();
        }
        self.reconnecting.lock().unwrap().remove(&id);
    }

    fn spawn_reconnect_scheduler(
        self,
        mut reconnect_rx: mpsc::UnboundedReceiver<RaftNodeId>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                        continue;
                    }
                    id = reconnect_rx.recv() => match id {
                        Some(id) => id,
                        None => return,
                    },
                };
                let transport = self.clone();
                let mut stop_rx = stop_rx.clone();
                tokio::spawn(async move {
                    transport.reconnect_loop(id, &mut stop_rx).await;
                });
            }
        });
    }

    async fn reconnect_loop(&self, id: RaftNodeId, stop_rx: &mut watch::Receiver<bool>) {
        let mut attempt = 0usize;
        loop {
            if *stop_rx.borrow() {
                self.reconnecting.lock().unwrap().remove(&id);
                return;
            }
            let addr = { self.addrs.read().await.get(&id).cloned() };
            let Some(addr) = addr else {
                self.reconnecting.lock().unwrap().remove(&id);
                return;
            };
            if self.connections.read().await.contains_key(&id) {
                self.reconnecting.lock().unwrap().remove(&id);
                return;
            }

            match self.dial(id, addr).await {
                Ok(()) => return,
                Err(e) => {
                    let delay_ms = RECONNECT_BACKOFF_MS
                        .get(attempt)
                        .copied()
                        .unwrap_or(RECONNECT_BACKOFF_CAP_MS);
                    warn!(peer = id, error = %e, delay_ms, "reconnect attempt failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}
