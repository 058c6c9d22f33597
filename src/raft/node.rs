//! The Raft state machine proper: role/term/vote bookkeeping, the
//! in-memory log, PreVote-gated elections, AppendEntries handling, leader
//! commit advancement, and the Ready/advance protocol the driver pumps.
//!
//! Grounded on the teacher's `clustering::raft::RaftNode`
//! (`PersistentState`/`VolatileState`/`LeaderState`, `calculate_commit_index`)
//! generalized for PreVote and the exact current-term-only commit rule
//! spec.md requires — the teacher's `calculate_commit_index` takes the
//! match-index median regardless of term, which is the classic bug; this
//! implementation only counts entries proposed in the current term.

use crate::error::{RaftError, Result};
use crate::raft::types::{
    AppendEntriesRequest, AppendEntriesResponse, ConfState, EntryType, HardState,
    InstallSnapshotRequest, InstallSnapshotResponse, LogEntry, LogIndex, Message, MessageBody,
    RaftNodeId, Role, Snapshot, SoftState, Term, VoteRequest, VoteResponse,
};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Everything the driver must persist, send, and apply after one pump of
/// the state machine, processed in exactly this order per spec.md §4.2:
/// persist entries, persist hard_state, send messages, apply committed
/// entries, advance.
#[derive(Debug, Default)]
pub struct Ready {
    pub hard_state: Option<HardState>,
    pub entries: Vec<LogEntry>,
    pub committed_entries: Vec<LogEntry>,
    pub messages: Vec<Message>,
    pub snapshot: Option<Snapshot>,
    pub soft_state: Option<SoftState>,
}

impl Ready {
    fn is_empty(&self) -> bool {
        self.hard_state.is_none()
            && self.entries.is_empty()
            && self.committed_entries.is_empty()
            && self.messages.is_empty()
            && self.snapshot.is_none()
            && self.soft_state.is_none()
    }
}

struct PendingReady {
    up_to_entries: LogIndex,
    hard_state: HardState,
    up_to_committed: LogIndex,
}

pub struct RaftNode {
    id: RaftNodeId,
    role: Role,
    current_term: Term,
    voted_for: Option<RaftNodeId>,
    leader_id: Option<RaftNodeId>,
    conf_state: ConfState,

    /// `log[i]` has index `log_first_index + i`.
    log: Vec<LogEntry>,
    log_first_index: LogIndex,
    snapshot_index: LogIndex,
    snapshot_term: Term,

    commit_index: LogIndex,
    persisted_index: LogIndex,
    last_committed_sent: LogIndex,
    last_persisted_hard_state: HardState,
    pending: Option<PendingReady>,
    snapshot_pending: Option<Snapshot>,

    election_elapsed: u64,
    heartbeat_elapsed: u64,
    election_timeout: u64,
    election_timeout_min: u64,
    election_timeout_max: u64,
    heartbeat_timeout: u64,

    pre_votes_received: HashMap<RaftNodeId, bool>,
    votes_received: HashMap<RaftNodeId, bool>,

    next_index: HashMap<RaftNodeId, LogIndex>,
    match_index: HashMap<RaftNodeId, LogIndex>,

    /// Index of the single uncommitted ConfChange entry, if any (P6).
    conf_change_in_flight: Option<LogIndex>,

    msgs: Vec<Message>,
    soft_state_dirty: bool,
}

impl RaftNode {
    /// Constructs a node from whatever storage handed back on open: the
    /// durable `HardState`, `ConfState`, and the log entries already on
    /// disk (all counted as persisted — `persisted_index` starts at their
    /// last index).
    pub fn new(
        id: RaftNodeId,
        hard_state: HardState,
        conf_state: ConfState,
        log: Vec<LogEntry>,
        snapshot: Option<&Snapshot>,
        election_timeout_ticks: u64,
        heartbeat_timeout_ticks: u64,
    ) -> Self {
        let (snapshot_index, snapshot_term) = snapshot
            .map(|s| (s.metadata.index, s.metadata.term))
            .unwrap_or((0, 0));
        let log_first_index = snapshot_index + 1;
        let persisted_index = log.last().map(|e| e.index).unwrap_or(snapshot_index);

        let mut node = Self {
            id,
            role: Role::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.vote,
            leader_id: None,
            conf_state,
            log,
            log_first_index,
            snapshot_index,
            snapshot_term,
            commit_index: hard_state.commit,
            persisted_index,
            last_committed_sent: 0,
            last_persisted_hard_state: hard_state,
            pending: None,
            snapshot_pending: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            election_timeout: election_timeout_ticks,
            election_timeout_min: election_timeout_ticks,
            election_timeout_max: election_timeout_ticks * 2,
            heartbeat_timeout: heartbeat_timeout_ticks,
            pre_votes_received: HashMap::new(),
            votes_received: HashMap::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            conf_change_in_flight: None,
            msgs: Vec::new(),
            soft_state_dirty: false,
        };
        // An uncommitted ConfChange left in the persisted log (index beyond
        // `hard_state.commit`) is still "in flight" after a restart (P6) —
        // recompute rather than assuming a clean log, since the log handed
        // in here may carry one from before the crash.
        node.conf_change_in_flight = node
            .log
            .iter()
            .find(|e| e.index > node.commit_index && matches!(e.entry_type, EntryType::ConfChange | EntryType::ConfChangeV2))
            .map(|e| e.index);
        node.reset_election_timeout();
        node
    }

    // --- accessors ------------------------------------------------------

    pub fn id(&self) -> RaftNodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader_id(&self) -> Option<RaftNodeId> {
        self.leader_id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn conf_state(&self) -> &ConfState {
        &self.conf_state
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.last().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub fn conf_change_in_flight(&self) -> Option<LogIndex> {
        self.conf_change_in_flight
    }

    pub(crate) fn conf_state_mut(&mut self) -> &mut ConfState {
        &mut self.conf_state
    }

    pub(crate) fn clear_conf_change_in_flight(&mut self) {
        self.conf_change_in_flight = None;
    }

    pub(crate) fn init_replication_tracking(&mut self, id: RaftNodeId) {
        if id == self.id {
            return;
        }
        let next = self.last_index() + 1;
        self.next_index.entry(id).or_insert(next);
        self.match_index.entry(id).or_insert(0);
    }

    pub(crate) fn drop_replication_tracking(&mut self, id: RaftNodeId) {
        self.next_index.remove(&id);
        self.match_index.remove(&id);
    }

    fn soft_state(&self) -> SoftState {
        SoftState {
            leader_id: self.leader_id,
            role: self.role,
        }
    }

    // --- log helpers ------------------------------------------------------

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.log_first_index {
            return None;
        }
        self.log.get((index - self.log_first_index) as usize)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn slice_from(&self, from: LogIndex) -> Vec<LogEntry> {
        if from < self.log_first_index || from > self.last_index() {
            return Vec::new();
        }
        self.log[(from - self.log_first_index) as usize..].to_vec()
    }

    fn slice_range(&self, from: LogIndex, to_exclusive: LogIndex) -> Vec<LogEntry> {
        let from = from.max(self.log_first_index);
        if from >= to_exclusive {
            return Vec::new();
        }
        self.slice_from(from)
            .into_iter()
            .take_while(|e| e.index < to_exclusive)
            .collect()
    }

    fn log_is_up_to_date(&self, candidate_last_term: Term, candidate_last_index: LogIndex) -> bool {
        candidate_last_term > self.last_term()
            || (candidate_last_term == self.last_term() && candidate_last_index >= self.last_index())
    }

    fn append_local_entry(&mut self, entry_type: EntryType, data: Vec<u8>) -> LogIndex {
        let index = self.last_index() + 1;
        self.log.push(LogEntry::new(self.current_term, index, entry_type, data));
        index
    }

    fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.log_first_index {
            self.log.clear();
        } else {
            self.log.truncate((index - self.log_first_index) as usize);
        }
    }

    // --- timers -----------------------------------------------------------

    fn reset_election_timeout(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout = rand::rng().random_range(self.election_timeout_min..self.election_timeout_max);
    }

    /// Advanced by one per external tick (spec.md §4.2/§4.4/§5: 100 ms
    /// tick, election/heartbeat purely tick-counted; a late tick source may
    /// call this twice in a row without breaking correctness).
    pub fn tick(&mut self) {
        if self.is_leader() {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= self.heartbeat_timeout {
                self.heartbeat_elapsed = 0;
                self.broadcast_append();
            }
            return;
        }

        if self.is_single_voter_cluster() {
            self.campaign();
            return;
        }

        self.election_elapsed += 1;
        if self.election_elapsed >= self.election_timeout {
            self.campaign();
        }
    }

    fn is_single_voter_cluster(&self) -> bool {
        self.conf_state.voters.len() == 1 && self.conf_state.voters[0] == self.id
    }

    // --- role transitions ---------------------------------------------------

    fn become_follower(&mut self, term: Term, leader: Option<RaftNodeId>) {
        let role_changed = self.role != Role::Follower;
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = leader;
        self.reset_election_timeout();
        self.pre_votes_received.clear();
        self.votes_received.clear();
        if role_changed || leader.is_some() {
            self.soft_state_dirty = true;
        }
    }

    /// Entry point for both the single-node bootstrap fast path and the
    /// normal PreVote-gated election (spec.md §4.2).
    pub fn campaign(&mut self) {
        if self.is_leader() {
            return;
        }

        if self.is_single_voter_cluster() {
            self.start_real_election();
            return;
        }

        self.role = Role::PreCandidate;
        self.reset_election_timeout();
        self.pre_votes_received.clear();
        self.pre_votes_received.insert(self.id, true);
        self.soft_state_dirty = true;

        let next_term = self.current_term + 1;
        for &peer in &self.conf_state.voters.clone() {
            if peer == self.id {
                continue;
            }
            self.send(
                peer,
                MessageBody::VoteRequest(VoteRequest {
                    term: next_term,
                    candidate_id: self.id,
                    last_log_index: self.last_index(),
                    last_log_term: self.last_term(),
                    pre_vote: true,
                }),
            );
        }
        self.check_prevote_quorum();
    }

    fn check_prevote_quorum(&mut self) {
        let quorum = self.conf_state.quorum();
        let granted = self.pre_votes_received.values().filter(|v| **v).count();
        if granted >= quorum {
            self.start_real_election();
        }
    }

    fn start_real_election(&mut self) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.reset_election_timeout();
        self.votes_received.clear();
        self.votes_received.insert(self.id, true);
        self.soft_state_dirty = true;

        for &peer in &self.conf_state.voters.clone() {
            if peer == self.id {
                continue;
            }
            self.send(
                peer,
                MessageBody::VoteRequest(VoteRequest {
                    term: self.current_term,
                    candidate_id: self.id,
                    last_log_index: self.last_index(),
                    last_log_term: self.last_term(),
                    pre_vote: false,
                }),
            );
        }
        self.check_vote_quorum();
    }

    fn check_vote_quorum(&mut self) {
        let quorum = self.conf_state.quorum();
        let granted = self.votes_received.values().filter(|v| **v).count();
        if granted >= quorum {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        info!(term = self.current_term, id = self.id, "became leader");
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.heartbeat_elapsed = 0;
        self.soft_state_dirty = true;

        let last = self.last_index();
        self.next_index.clear();
        self.match_index.clear();
        for &member in &self.conf_state.all_members() {
            if member == self.id {
                continue;
            }
            self.next_index.insert(member, last + 1);
            self.match_index.insert(member, 0);
        }

        // Leader-commit-of-own-term barrier: an empty Normal entry so the
        // current-term commit rule can advance past entries from prior terms.
        self.append_local_entry(EntryType::Normal, Vec::new());
        self.broadcast_append();
    }

    // --- message dispatch ---------------------------------------------------

    fn send(&mut self, to: RaftNodeId, body: MessageBody) {
        self.msgs.push(Message { from: self.id, to, body });
    }

    /// Entry point for every inbound message, whether from the transport
    /// reader task or the self-addressed bypass path.
    pub fn step(&mut self, msg: Message) {
        let from = msg.from;
        match msg.body {
            MessageBody::VoteRequest(req) => {
                let resp = self.handle_vote_request(req);
                self.send(from, MessageBody::VoteResponse(resp));
            }
            MessageBody::VoteResponse(resp) => self.handle_vote_response(from, resp),
            MessageBody::AppendEntries(req) => {
                let resp = self.handle_append_entries(req);
                self.send(from, MessageBody::AppendEntriesResponse(resp));
            }
            MessageBody::AppendEntriesResponse(resp) => self.handle_append_entries_response(from, resp),
            MessageBody::InstallSnapshot(req) => {
                let resp = self.handle_install_snapshot(req);
                self.send(from, MessageBody::InstallSnapshotResponse(resp));
            }
            MessageBody::InstallSnapshotResponse(_) => {
                // Single-blob snapshots (spec.md §1 Non-goals: no streaming
                // optimisation); nothing further to drive from this ack.
            }
        }
    }

    fn handle_vote_request(&mut self, req: VoteRequest) -> VoteResponse {
        if req.pre_vote {
            let log_ok = self.log_is_up_to_date(req.last_log_term, req.last_log_index);
            let recently_heard_from_leader =
                self.leader_id.is_some() && self.election_elapsed < self.election_timeout;
            let granted = req.term >= self.current_term && log_ok && !recently_heard_from_leader;
            return VoteResponse {
                term: self.current_term,
                vote_granted: granted,
                pre_vote: true,
            };
        }

        if req.term > self.current_term {
            self.become_follower(req.term, None);
        }

        let mut granted = false;
        if req.term >= self.current_term {
            let can_vote = self.voted_for.is_none() || self.voted_for == Some(req.candidate_id);
            let log_ok = self.log_is_up_to_date(req.last_log_term, req.last_log_index);
            if can_vote && log_ok {
                self.voted_for = Some(req.candidate_id);
                granted = true;
                self.election_elapsed = 0;
            }
        }

        VoteResponse {
            term: self.current_term,
            vote_granted: granted,
            pre_vote: false,
        }
    }

    fn handle_vote_response(&mut self, from: RaftNodeId, resp: VoteResponse) {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None);
            return;
        }

        if resp.pre_vote {
            if self.role != Role::PreCandidate {
                return;
            }
            self.pre_votes_received.insert(from, resp.vote_granted);
            self.check_prevote_quorum();
        } else {
            if self.role != Role::Candidate || resp.term != self.current_term {
                return;
            }
            self.votes_received.insert(from, resp.vote_granted);
            self.check_vote_quorum();
        }
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        if req.term < self.current_term {
            return AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
                conflict_term: None,
                conflict_index: None,
            };
        }

        if req.term > self.current_term {
            self.become_follower(req.term, Some(req.leader_id));
        } else {
            if self.role != Role::Follower {
                self.become_follower(self.current_term, Some(req.leader_id));
            }
            if self.leader_id != Some(req.leader_id) {
                self.leader_id = Some(req.leader_id);
                self.soft_state_dirty = true;
            }
        }
        self.election_elapsed = 0;

        if req.prev_log_index > 0 {
            match self.term_at(req.prev_log_index) {
                Some(t) if t == req.prev_log_term => {}
                Some(t) => {
                    return AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        match_index: 0,
                        conflict_term: Some(t),
                        conflict_index: Some(req.prev_log_index),
                    };
                }
                None => {
                    return AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        match_index: 0,
                        conflict_term: None,
                        conflict_index: Some(self.last_index()),
                    };
                }
            }
        }

        if !req.entries.is_empty() {
            self.truncate_from(req.prev_log_index + 1);
            self.log.extend(req.entries.iter().cloned());
        }

        let last_new_index = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(last_new_index.max(self.last_index()));
        }

        AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: self.last_index(),
            conflict_term: None,
            conflict_index: None,
        }
    }

    fn handle_append_entries_response(&mut self, from: RaftNodeId, resp: AppendEntriesResponse) {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None);
            return;
        }
        if !self.is_leader() {
            return;
        }

        if resp.success {
            self.next_index.insert(from, resp.match_index + 1);
            self.match_index.insert(from, resp.match_index);
            self.try_advance_commit();
            if resp.match_index < self.last_index() {
                self.send_append_to(from);
            }
        } else {
            let current_next = self.next_index.get(&from).copied().unwrap_or(1);
            let new_next = resp
                .conflict_index
                .unwrap_or_else(|| current_next.saturating_sub(1))
                .max(1);
            self.next_index.insert(from, new_next);
            self.send_append_to(from);
        }
    }

    fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        if req.term > self.current_term {
            self.become_follower(req.term, Some(req.leader_id));
        }
        if req.term < self.current_term {
            return InstallSnapshotResponse { term: self.current_term, bytes_stored: 0 };
        }
        if req.done {
            let metadata = req.metadata.clone();
            self.log.retain(|e| e.index > metadata.index);
            self.log_first_index = metadata.index + 1;
            self.snapshot_index = metadata.index;
            self.snapshot_term = metadata.term;
            self.conf_state = metadata.conf_state.clone();
            self.commit_index = self.commit_index.max(metadata.index);
            self.persisted_index = self.persisted_index.max(metadata.index);
            self.last_committed_sent = self.last_committed_sent.max(metadata.index);
            self.snapshot_pending = Some(Snapshot { metadata, data: req.data.clone() });
        }
        InstallSnapshotResponse {
            term: self.current_term,
            bytes_stored: req.offset + req.data.len() as u64,
        }
    }

    // --- leader replication --------------------------------------------------

    fn broadcast_append(&mut self) {
        let peers: Vec<RaftNodeId> = self.conf_state.all_members().into_iter().filter(|p| *p != self.id).collect();
        for peer in peers {
            self.send_append_to(peer);
        }
        // A single-voter cluster has no peers to ack an AppendEntries, so
        // the leader's own match (always up to date) must be enough to
        // advance commit on its own — otherwise a lone node would never
        // commit anything (spec.md §4.2/§8 "Single-node cluster elects
        // itself leader within one tick" implies it also makes progress).
        self.try_advance_commit();
    }

    fn send_append_to(&mut self, peer: RaftNodeId) {
        let next = self.next_index.get(&peer).copied().unwrap_or(self.last_index() + 1);
        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);
        let entries = self.slice_from(next);
        let leader_commit = self.commit_index;
        self.send(
            peer,
            MessageBody::AppendEntries(AppendEntriesRequest {
                term: self.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            }),
        );
    }

    /// The leader advances `commit_index` to the highest N replicated on a
    /// quorum whose entry was proposed in the *current* term — this is the
    /// fix for the classic committed-by-count-across-terms bug spec.md
    /// §4.2 calls out by name.
    fn try_advance_commit(&mut self) {
        let quorum = self.conf_state.quorum();
        let mut indices: Vec<LogIndex> = self
            .conf_state
            .voters
            .iter()
            .map(|&v| if v == self.id { self.last_index() } else { *self.match_index.get(&v).unwrap_or(&0) })
            .collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        if indices.len() < quorum {
            return;
        }
        let n = indices[quorum - 1];
        if n > self.commit_index && self.term_at(n) == Some(self.current_term) {
            self.commit_index = n;
        }
    }

    // --- propose ------------------------------------------------------------

    pub fn propose(&mut self, data: Vec<u8>) -> Result<LogIndex> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader { leader_hint: self.leader_id });
        }
        let index = self.append_local_entry(EntryType::Normal, data);
        self.broadcast_append();
        Ok(index)
    }

    pub fn propose_conf_change(
        &mut self,
        cc: crate::raft::types::ConfChange,
    ) -> Result<LogIndex> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader { leader_hint: self.leader_id });
        }
        if self.conf_change_in_flight.is_some() {
            return Err(RaftError::ConfChangeInFlight);
        }
        let data = serde_json::to_vec(&cc)?;
        let index = self.append_local_entry(EntryType::ConfChange, data);
        self.conf_change_in_flight = Some(index);
        self.broadcast_append();
        Ok(index)
    }

    // --- Ready/advance --------------------------------------------------------

    fn hard_state_snapshot(&self) -> HardState {
        HardState {
            term: self.current_term,
            vote: self.voted_for,
            commit: self.commit_index,
        }
    }

    pub fn has_ready(&self) -> bool {
        self.last_index() > self.persisted_index
            || self.hard_state_snapshot() != self.last_persisted_hard_state
            || self.last_committed_sent < self.commit_index
            || !self.msgs.is_empty()
            || self.snapshot_pending.is_some()
            || self.soft_state_dirty
    }

    /// Produces one Ready batch. Safe to call repeatedly before `advance()`
    /// — it recomputes from current cursors rather than draining them, so a
    /// driver that calls `ready()` again without advancing gets the same
    /// batch rather than losing data (but per spec.md §4.2 it must not do
    /// that: `advance()` is required before a materially new Ready appears).
    pub fn ready(&mut self) -> Ready {
        let hs_now = self.hard_state_snapshot();
        let hard_state = if hs_now != self.last_persisted_hard_state {
            Some(hs_now.clone())
        } else {
            None
        };
        let entries = if self.last_index() > self.persisted_index {
            self.slice_from(self.persisted_index + 1)
        } else {
            Vec::new()
        };
        let committed_entries = if self.last_committed_sent < self.commit_index {
            self.slice_range(self.last_committed_sent + 1, self.commit_index + 1)
        } else {
            Vec::new()
        };
        let messages = std::mem::take(&mut self.msgs);
        let snapshot = self.snapshot_pending.take();
        let soft_state = if self.soft_state_dirty { Some(self.soft_state()) } else { None };

        self.pending = Some(PendingReady {
            up_to_entries: self.last_index(),
            hard_state: hs_now,
            up_to_committed: self.commit_index,
        });

        let ready = Ready {
            hard_state,
            entries,
            committed_entries,
            messages,
            snapshot,
            soft_state,
        };
        if ready.is_empty() {
            debug!("produced empty Ready");
        }
        ready
    }

    /// Must be called once the driver has finished the 5-step sequence for
    /// the Ready it just pulled (spec.md §4.2/§4.4). Moves the internal
    /// cursors forward and clears the soft-state-dirty flag.
    pub fn advance(&mut self) {
        if let Some(p) = self.pending.take() {
            self.persisted_index = self.persisted_index.max(p.up_to_entries);
            self.last_persisted_hard_state = p.hard_state;
            self.last_committed_sent = self.last_committed_sent.max(p.up_to_committed);
        } else {
            warn!("advance() called with no pending Ready");
        }
        self.soft_state_dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::ConfState;

    fn node(id: RaftNodeId, voters: Vec<RaftNodeId>) -> RaftNode {
        RaftNode::new(
            id,
            HardState::default(),
            ConfState::new(voters),
            Vec::new(),
            None,
            10,
            1,
        )
    }

    #[test]
    fn single_node_campaigns_on_first_tick() {
        let mut n = node(1, vec![1]);
        assert!(!n.is_leader());
        n.tick();
        assert!(n.is_leader());
        assert_eq!(n.current_term(), 1);
    }

    #[test]
    fn election_requires_prevote_then_real_vote() {
        let mut n = node(1, vec![1, 2, 3]);
        for _ in 0..10 {
            n.tick();
        }
        assert_eq!(n.role(), Role::PreCandidate);
        let ready = n.ready();
        assert_eq!(ready.messages.len(), 2);
        for m in &ready.messages {
            match &m.body {
                MessageBody::VoteRequest(req) => assert!(req.pre_vote),
                _ => panic!("expected vote request"),
            }
        }
        n.advance();

        n.step(Message {
            from: 2,
            to: 1,
            body: MessageBody::VoteResponse(VoteResponse { term: 0, vote_granted: true, pre_vote: true }),
        });
        assert_eq!(n.role(), Role::Candidate);
        assert_eq!(n.current_term(), 1);

        n.step(Message {
            from: 2,
            to: 1,
            body: MessageBody::VoteResponse(VoteResponse { term: 1, vote_granted: true, pre_vote: false }),
        });
        assert!(n.is_leader());
    }

    #[test]
    fn higher_term_append_entries_steps_down_candidate() {
        let mut n = node(1, vec![1, 2, 3]);
        for _ in 0..10 {
            n.tick();
        }
        assert_eq!(n.role(), Role::PreCandidate);
        n.step(Message {
            from: 2,
            to: 1,
            body: MessageBody::AppendEntries(AppendEntriesRequest {
                term: 5,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            }),
        });
        assert_eq!(n.role(), Role::Follower);
        assert_eq!(n.current_term(), 5);
        assert_eq!(n.leader_id(), Some(2));
    }

    #[test]
    fn append_entries_rejects_on_mismatched_prev_term() {
        let mut n = node(1, vec![1, 2]);
        n.log.push(LogEntry::new(1, 1, EntryType::Normal, vec![]));
        let resp = n.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 2,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!resp.success);
        assert_eq!(resp.conflict_term, Some(1));
    }

    #[test]
    fn commit_only_advances_for_current_term_entries() {
        let mut n = node(1, vec![1, 2, 3]);
        n.current_term = 2;
        n.log.push(LogEntry::new(1, 1, EntryType::Normal, vec![]));
        n.role = Role::Leader;
        n.leader_id = Some(1);
        n.next_index.insert(2, 2);
        n.next_index.insert(3, 2);
        n.match_index.insert(2, 1);
        n.match_index.insert(3, 0);
        n.handle_append_entries_response(2, AppendEntriesResponse {
            term: 2,
            success: true,
            match_index: 1,
            conflict_term: None,
            conflict_index: None,
        });
        // entry at index 1 is from term 1, not current term 2: must not commit.
        assert_eq!(n.commit_index(), 0);
    }

    #[test]
    fn propose_requires_leader() {
        let mut n = node(1, vec![1, 2, 3]);
        let err = n.propose(vec![1]).unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[test]
    fn ready_then_advance_moves_cursors() {
        let mut n = node(1, vec![1]);
        n.tick();
        assert!(n.has_ready());
        let ready = n.ready();
        assert!(ready.hard_state.is_some());
        n.advance();
        assert!(!n.has_ready());
    }
}
