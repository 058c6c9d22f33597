//! C2: the Raft state machine. `types` holds the wire/persisted shapes,
//! `node` the role/term/log/commit logic and the Ready/advance protocol,
//! `membership` the ConfChange apply-time mutation of `ConfState`.

pub mod membership;
pub mod node;
pub mod types;

pub use node::{Ready, RaftNode};
pub use types::*;
