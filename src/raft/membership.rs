//! ConfChange apply-time semantics (spec.md §4.2, §9 Open Question #1):
//! a membership change takes effect exactly when its log entry is
//! *applied*, never at commit time, and at most one such change may be
//! uncommitted at a time. This module owns the mutation of `RaftNode`'s
//! `ConfState` and leader replication maps; `apply.rs` (C5) is the only
//! caller, once a `ConfChange`/`ConfChangeV2` entry is committed and
//! handed to it.
//!
//! `replay_conf_state` reconstructs the same `ConfState` from a persisted
//! log on startup: nothing in this crate creates a `Snapshot` yet (no
//! `snapshot_count`-triggered compaction is implemented, see `DESIGN.md`),
//! so membership changes made after bootstrap have no durable form of
//! their own — the persisted log is the only record of them, and
//! `engine::build_node` must replay it independently of `applied_index`
//! (that watermark only gates the KV apply pipeline's exactly-once
//! behavior, not configuration recovery) to avoid losing membership on
//! every restart.
//!
//! Grounded on the teacher's `clustering::membership::{Member, MemberState}`
//! (SWIM gossip membership), adapted here to a log-driven voter/learner
//! model since spec.md's membership is driven by the Raft log, not gossip.

use crate::error::{RaftError, Result};
use crate::raft::node::RaftNode;
use crate::raft::types::{ConfChange, ConfChangeOp, ConfState, EntryType, LogEntry, LogIndex};

/// Pure voter/learner set mutation for one op, shared by live apply
/// (`RaftNode::apply_conf_change`) and log replay (`replay_conf_state`) so
/// the two can never drift apart.
fn mutate_conf_state(conf_state: &mut ConfState, cc: &ConfChange) {
    match cc.op {
        ConfChangeOp::AddVoter => {
            conf_state.learners.retain(|&id| id != cc.node_id);
            if !conf_state.voters.contains(&cc.node_id) {
                conf_state.voters.push(cc.node_id);
            }
        }
        ConfChangeOp::AddLearner => {
            if !conf_state.learners.contains(&cc.node_id) {
                conf_state.learners.push(cc.node_id);
            }
        }
        ConfChangeOp::RemoveNode => {
            conf_state.voters.retain(|&id| id != cc.node_id);
            conf_state.learners.retain(|&id| id != cc.node_id);
        }
    }
}

/// Reconstructs membership as of `commit` by replaying every committed
/// `ConfChange`/`ConfChangeV2` entry in `log` onto `base`, in log order.
/// `log` is assumed sorted ascending by index (as `Storage::entries`
/// returns it), so replay stops at the first entry past `commit` rather
/// than scanning the whole log. An entry that fails to decode as a
/// `ConfChange` is skipped rather than treated as fatal — decode errors at
/// this point would already have been fatal when the entry was first
/// applied (`apply.rs`), so by construction this should never happen to an
/// already-committed entry.
pub fn replay_conf_state(base: ConfState, log: &[LogEntry], commit: LogIndex) -> ConfState {
    let mut conf_state = base;
    for entry in log {
        if entry.index > commit {
            break;
        }
        if !matches!(entry.entry_type, EntryType::ConfChange | EntryType::ConfChangeV2) {
            continue;
        }
        if let Ok(cc) = serde_json::from_slice::<ConfChange>(&entry.data) {
            mutate_conf_state(&mut conf_state, &cc);
        }
    }
    conf_state
}

impl RaftNode {
    /// Applies a committed `ConfChange` entry at `index`. Mutates voter/
    /// learner sets and (if this node is leader) the `next_index`/
    /// `match_index` replication maps, and clears `conf_change_in_flight`
    /// if `index` was the tracked in-flight change.
    pub fn apply_conf_change(&mut self, index: LogIndex, cc: &ConfChange) -> Result<()> {
        mutate_conf_state(self.conf_state_mut(), cc);
        match cc.op {
            ConfChangeOp::AddVoter | ConfChangeOp::AddLearner => self.init_replication_tracking(cc.node_id),
            ConfChangeOp::RemoveNode => self.drop_replication_tracking(cc.node_id),
        }

        if self.conf_state().voters.is_empty() {
            return Err(RaftError::Fatal(
                "ConfChange would remove the last voter from the cluster".into(),
            ));
        }

        if self.conf_change_in_flight() == Some(index) {
            self.clear_conf_change_in_flight();
        }
        Ok(())
    }
}
