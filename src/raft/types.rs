// Core Raft wire and persisted types.
//
// Field shapes follow the teacher's clustering::raft message structs
// (VoteRequest/VoteResponse/AppendEntriesRequest/Response,
// InstallSnapshotRequest/Response, SnapshotMetadata), generalized to the
// entry-type tagging and ConfState voters/learners model this spec requires.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type RaftNodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Tag distinguishing an opaque client command from a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    ConfChange,
    ConfChangeV2,
}

/// An entry in the replicated log. `index` is gap-free and strictly
/// increasing within the log; `term` is non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub entry_type: EntryType,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, entry_type: EntryType, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            entry_type,
            data,
        }
    }

    /// A leader-commit-of-own-term barrier: empty Normal payload.
    pub fn is_empty_barrier(&self) -> bool {
        self.entry_type == EntryType::Normal && self.data.is_empty()
    }
}

/// The durable tuple that must survive crashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardState {
    pub term: Term,
    pub vote: Option<RaftNodeId>,
    pub commit: LogIndex,
}

impl Default for HardState {
    fn default() -> Self {
        Self {
            term: 0,
            vote: None,
            commit: 0,
        }
    }
}

/// Current cluster membership: voters and (non-voting) learners.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfState {
    pub voters: Vec<RaftNodeId>,
    pub learners: Vec<RaftNodeId>,
}

impl ConfState {
    pub fn new(voters: Vec<RaftNodeId>) -> Self {
        Self {
            voters,
            learners: Vec::new(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn contains_voter(&self, id: RaftNodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn all_members(&self) -> HashSet<RaftNodeId> {
        self.voters.iter().chain(self.learners.iter()).copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub index: LogIndex,
    pub term: Term,
    pub conf_state: ConfState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

/// A single conf-change operation, applied (not committed) to take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeOp {
    AddVoter,
    AddLearner,
    RemoveNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfChange {
    pub op: ConfChangeOp,
    pub node_id: RaftNodeId,
    pub address: Option<String>,
}

// --- Wire messages -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: RaftNodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// PreVote requests never cause the receiver to bump its term or record
    /// a vote; they are a straw poll only.
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: RaftNodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    pub conflict_term: Option<Term>,
    pub conflict_index: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: RaftNodeId,
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
    pub offset: u64,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub bytes_stored: u64,
}

/// Every message exchanged over the peer transport, tagged with sender and
/// recipient raft_id so the driver and transport can route without
/// inspecting the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub from: RaftNodeId,
    pub to: RaftNodeId,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

/// Non-durable role/leader hints published for observers after each Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftState {
    pub leader_id: Option<RaftNodeId>,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}
