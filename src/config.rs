use std::time::Duration;

/// One entry of `initial_cluster`: a member's name and its peer TCP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ClusterMember {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Whether this node is joining a brand-new cluster or restarting into one
/// that already has durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
}

/// Engine configuration. Arrives fully populated — this crate does no
/// config-file parsing, per the spec's scope (§1 Explicitly out of scope).
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's human-readable name; must appear in `initial_cluster`.
    pub name: String,
    /// Ordered list, identical on every member. Position determines `raft_id`.
    pub initial_cluster: Vec<ClusterMember>,
    pub initial_cluster_state: ClusterState,
    pub data_dir: String,
    pub listen_peer_host: String,
    pub listen_peer_port: u16,
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub snapshot_count: u64,
    pub max_log_entries: u64,
    pub batch_size: usize,
    pub max_batch_delay_ms: u64,
    pub propose_timeout_ms: u64,
    pub propose_replication_timeout_ms: u64,
    pub conf_change_max_retries: u32,
    /// Consecutive persistence failures before the observer reports unhealthy.
    pub persistence_failure_threshold: u64,
    /// `tracing-subscriber` env-filter directive, e.g. "info".
    pub log_level: String,
}

impl Config {
    /// Validate invariants the spec calls out explicitly: election timeout
    /// floor, and the ≥5× heartbeat relationship.
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_ms < 100 {
            return Err(format!(
                "election_timeout_ms must be >= 100, got {}",
                self.election_timeout_ms
            ));
        }
        if self.heartbeat_interval_ms < 10 {
            return Err(format!(
                "heartbeat_interval_ms must be >= 10, got {}",
                self.heartbeat_interval_ms
            ));
        }
        if self.election_timeout_ms < self.heartbeat_interval_ms * 5 {
            return Err(format!(
                "election_timeout_ms ({}) must be >= 5x heartbeat_interval_ms ({})",
                self.election_timeout_ms, self.heartbeat_interval_ms
            ));
        }
        if !self.initial_cluster.iter().any(|m| m.name == self.name) {
            return Err(format!(
                "name '{}' not present in initial_cluster",
                self.name
            ));
        }
        Ok(())
    }

    /// This node's 1-based raft_id: its position in `initial_cluster`.
    pub fn local_raft_id(&self) -> u64 {
        self.initial_cluster
            .iter()
            .position(|m| m.name == self.name)
            .map(|p| (p + 1) as u64)
            .unwrap_or(0)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_ms),
            Duration::from_millis(self.election_timeout_ms * 2),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn propose_replication_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_replication_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "node1".to_string(),
            initial_cluster: vec![ClusterMember::new("node1", "127.0.0.1", 7001)],
            initial_cluster_state: ClusterState::New,
            data_dir: "./data".to_string(),
            listen_peer_host: "0.0.0.0".to_string(),
            listen_peer_port: 7001,
            election_timeout_ms: 1000,
            heartbeat_interval_ms: 100,
            snapshot_count: 10_000,
            max_log_entries: 100_000,
            batch_size: 100,
            max_batch_delay_ms: 10,
            propose_timeout_ms: 30_000,
            propose_replication_timeout_ms: 5_000,
            conf_change_max_retries: 3,
            persistence_failure_threshold: 5,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_heartbeat_too_close_to_election_timeout() {
        let mut cfg = Config::default();
        cfg.heartbeat_interval_ms = 300;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn local_raft_id_matches_position() {
        let mut cfg = Config::default();
        cfg.initial_cluster = vec![
            ClusterMember::new("a", "h", 1),
            ClusterMember::new("b", "h", 2),
            ClusterMember::new("c", "h", 3),
        ];
        cfg.name = "b".to_string();
        assert_eq!(cfg.local_raft_id(), 2);
    }
}
