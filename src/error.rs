use thiserror::Error;

/// Error taxonomy for the Raft engine.
///
/// Variants are grouped the way the spec's error taxonomy groups them:
/// validation, not-leader, timeout, transient transport, degraded
/// persistence, and fatal invariant violations. `is_fatal()` tells the
/// driver whether a returned error should force process exit.
#[derive(Error, Debug, Clone)]
pub enum RaftError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration change already in flight")]
    ConfChangeInFlight,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence degraded: {0}")]
    PersistenceDegraded(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl RaftError {
    /// True for errors that §7 classifies as fatal: the node must crash so
    /// a restart can either recover from durable state or force manual
    /// intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Fatal(_))
    }
}

impl From<std::io::Error> for RaftError {
    fn from(e: std::io::Error) -> Self {
        RaftError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
