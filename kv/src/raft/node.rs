//! Leader election and log replication. A [`RaftNode`] owns a
//! [`FileRaftLog`] and nothing else network-related -- it never touches a
//! [`super::transport::Transport`] itself. Callers drive it by feeding in
//! received messages via [`RaftNode::step`] and ticking a logical clock via
//! [`RaftNode::tick`], and are responsible for actually sending whatever
//! `(NodeId, Message)` pairs those calls return.
//!
//! This split keeps the consensus logic deterministic and easy to test: a
//! unit test can wire two or three `RaftNode`s together by hand, feeding one
//! node's outbox directly into another's `step`, with no real transport or
//! timer involved.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::error::{CResult, Error};

use super::log::{Entry, FileRaftLog, Index};
use super::message::Message;
use super::{NodeId, Term};
use crate::storage::engine::PersistentKV;

const MIN_ELECTION_TICKS: u32 = 10;
const MAX_ELECTION_TICKS: u32 = 20;
const HEARTBEAT_TICKS: u32 = 3;

#[derive(Debug)]
enum Role {
    Follower { leader: Option<NodeId> },
    Candidate { votes: HashSet<NodeId> },
    Leader { next_index: HashMap<NodeId, Index>, match_index: HashMap<NodeId, Index> },
}

pub struct RaftNode<E: PersistentKV> {
    id: NodeId,
    peers: Vec<NodeId>,
    log: FileRaftLog<E>,
    role: Role,
    election_elapsed: u32,
    election_timeout: u32,
    heartbeat_elapsed: u32,
}

impl<E: PersistentKV> RaftNode<E> {
    pub fn new(id: NodeId, peers: Vec<NodeId>, log: FileRaftLog<E>) -> Self {
        let election_timeout = Self::random_election_timeout();
        Self { id, peers, log, role: Role::Follower { leader: None }, election_elapsed: 0, election_timeout, heartbeat_elapsed: 0 }
    }

    fn random_election_timeout() -> u32 {
        rand::thread_rng().gen_range(MIN_ELECTION_TICKS..=MAX_ELECTION_TICKS)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        match &self.role {
            Role::Follower { leader } => *leader,
            Role::Leader { .. } => Some(self.id),
            Role::Candidate { .. } => None,
        }
    }

    pub fn current_term(&self) -> Term {
        self.log.get_term_vote().0
    }

    pub fn commit_index(&self) -> Index {
        self.log.get_commit_index().0
    }

    pub fn snapshot_index(&self) -> (Index, Term) {
        self.log.get_snapshot_index()
    }

    /// The term of the entry at `index`, if the log still has it -- `None`
    /// once it's fallen below the snapshot boundary.
    pub fn term_at(&mut self, index: Index) -> CResult<Option<Term>> {
        Ok(self.log.get(index)?.map(|e| e.term))
    }

    /// Marks a snapshot as covering everything up to `index`/`term`,
    /// discarding the log entries it made redundant. See
    /// `FileRaftLog::install_snapshot_point`.
    pub fn install_snapshot_point(&mut self, index: Index, term: Term) -> CResult<()> {
        self.log.install_snapshot_point(index, term)
    }

    /// Entries committed since `applied_index`, ready for the state machine.
    pub fn take_ready(&mut self, applied_index: Index) -> CResult<Vec<Entry>> {
        self.log.scan_apply(applied_index)
    }

    /// Appends `command` to the log (leader only) and returns both the new
    /// index and the `AppendEntries` messages to send each peer right away,
    /// rather than waiting for the next heartbeat.
    pub fn propose(&mut self, command: Vec<u8>) -> CResult<(Index, Vec<(NodeId, Message)>)> {
        if !self.is_leader() {
            return Err(Error::Unavailable(format!("node {} is not the leader", self.id)));
        }
        let index = self.log.append(Some(command))?;
        self.advance_commit()?;
        let outbound = self.broadcast_append()?;
        Ok((index, outbound))
    }

    /// Advances the logical clock by one tick, returning any messages this
    /// produced (an election's `RequestVote`s, or a leader's heartbeat
    /// `AppendEntries`s).
    pub fn tick(&mut self) -> CResult<Vec<(NodeId, Message)>> {
        if matches!(self.role, Role::Leader { .. }) {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= HEARTBEAT_TICKS {
                self.heartbeat_elapsed = 0;
                return self.broadcast_append();
            }
            return Ok(Vec::new());
        }

        self.election_elapsed += 1;
        if self.election_elapsed >= self.election_timeout {
            return self.become_candidate();
        }
        Ok(Vec::new())
    }

    /// Handles one received message, returning any reply/follow-up messages.
    pub fn step(&mut self, from: NodeId, message: Message) -> CResult<Vec<(NodeId, Message)>> {
        let message_term = match &message {
            Message::RequestVote { term, .. }
            | Message::RequestVoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. } => *term,
        };

        if message_term > self.current_term() {
            self.become_follower(message_term, None)?;
        }

        match message {
            Message::RequestVote { term, candidate, last_log_index, last_log_term } => {
                self.handle_request_vote(term, candidate, last_log_index, last_log_term)
            }
            Message::RequestVoteResponse { term, vote_granted } => self.handle_request_vote_response(from, term, vote_granted),
            Message::AppendEntries { term, leader, prev_log_index, prev_log_term, entries, leader_commit } => {
                self.handle_append_entries(term, leader, prev_log_index, prev_log_term, entries, leader_commit)
            }
            Message::AppendEntriesResponse { term, success, match_index } => {
                self.handle_append_entries_response(from, term, success, match_index)
            }
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> CResult<()> {
        if term > self.current_term() {
            self.log.set_term_vote(term, None)?;
        }
        if matches!(self.role, Role::Leader { .. }) {
            log::info!("node {} stepping down from leader in term {term}", self.id);
        }
        self.role = Role::Follower { leader };
        self.election_elapsed = 0;
        self.election_timeout = Self::random_election_timeout();
        Ok(())
    }

    fn become_candidate(&mut self) -> CResult<Vec<(NodeId, Message)>> {
        let term = self.current_term() + 1;
        self.log.set_term_vote(term, Some(self.id))?;
        self.role = Role::Candidate { votes: HashSet::from([self.id]) };
        self.election_elapsed = 0;
        self.election_timeout = Self::random_election_timeout();
        log::info!("node {} starting election for term {term}", self.id);

        if self.peers.is_empty() {
            return self.become_leader();
        }
        let (last_log_index, last_log_term) = self.log.get_last_index();
        Ok(self
            .peers
            .iter()
            .map(|&peer| (peer, Message::RequestVote { term, candidate: self.id, last_log_index, last_log_term }))
            .collect())
    }

    fn become_leader(&mut self) -> CResult<Vec<(NodeId, Message)>> {
        let (last_index, _) = self.log.get_last_index();
        let next_index = self.peers.iter().map(|&p| (p, last_index + 1)).collect();
        let match_index = self.peers.iter().map(|&p| (p, 0)).collect();
        self.role = Role::Leader { next_index, match_index };
        self.heartbeat_elapsed = 0;
        log::info!("node {} became leader for term {}", self.id, self.current_term());
        // A noop entry at the start of the new term lets the leader commit
        // entries from earlier terms once it's replicated (Raft 5.4.2).
        self.log.append(None)?;
        self.advance_commit()?;
        self.broadcast_append()
    }

    /// Recomputes the highest index a majority of the cluster -- this node
    /// included -- has replicated, and commits up to it if that's further
    /// than the current commit index and the entry was proposed in this
    /// node's own term (the Raft 5.4.2 restriction against committing
    /// entries from an earlier term by count alone).
    ///
    /// For a single-node cluster this is what lets `propose`/`become_leader`
    /// commit immediately: with zero peers, the leader's own log is the
    /// entire quorum.
    fn advance_commit(&mut self) -> CResult<()> {
        let own_last_index = self.log.get_last_index().0;
        let Role::Leader { match_index, .. } = &self.role else { return Ok(()) };
        let mut indexes: Vec<Index> = match_index.values().copied().chain(std::iter::once(own_last_index)).collect();
        indexes.sort_unstable();
        let majority_index = indexes[indexes.len() / 2];

        if majority_index > self.log.get_commit_index().0 {
            let committable_term = self.log.get(majority_index)?.map(|e| e.term);
            if committable_term == Some(self.log.get_term_vote().0) {
                self.log.commit(majority_index)?;
            }
        }
        Ok(())
    }

    fn broadcast_append(&mut self) -> CResult<Vec<(NodeId, Message)>> {
        let Role::Leader { next_index, .. } = &self.role else { return Ok(Vec::new()) };
        let term = self.current_term();
        let leader_commit = self.commit_index();
        let peers = self.peers.clone();
        let mut out = Vec::with_capacity(peers.len());
        for peer in peers {
            let next = *next_index.get(&peer).unwrap_or(&1);
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = if prev_log_index == 0 { 0 } else { self.log.get(prev_log_index)?.map(|e| e.term).unwrap_or(0) };
            let entries = self.log.scan(next, self.log.get_last_index().0)?;
            out.push((peer, Message::AppendEntries { term, leader: self.id, prev_log_index, prev_log_term, entries, leader_commit }));
        }
        Ok(out)
    }

    fn handle_request_vote(&mut self, term: Term, candidate: NodeId, last_log_index: Index, last_log_term: Term) -> CResult<Vec<(NodeId, Message)>> {
        let current_term = self.current_term();
        if term < current_term {
            return Ok(vec![(candidate, Message::RequestVoteResponse { term: current_term, vote_granted: false })]);
        }

        let (_, vote) = self.log.get_term_vote();
        let (our_last_index, our_last_term) = self.log.get_last_index();
        let candidate_up_to_date = last_log_term > our_last_term || (last_log_term == our_last_term && last_log_index >= our_last_index);

        let grant = (vote.is_none() || vote == Some(candidate)) && candidate_up_to_date;
        if grant {
            self.log.set_term_vote(term, Some(candidate))?;
            self.election_elapsed = 0;
        }
        Ok(vec![(candidate, Message::RequestVoteResponse { term, vote_granted: grant })])
    }

    fn handle_request_vote_response(&mut self, from: NodeId, term: Term, vote_granted: bool) -> CResult<Vec<(NodeId, Message)>> {
        if term != self.current_term() || !vote_granted {
            return Ok(Vec::new());
        }
        let Role::Candidate { votes } = &mut self.role else { return Ok(Vec::new()) };
        votes.insert(from);
        let quorum = (self.peers.len() + 1) / 2 + 1;
        if votes.len() >= quorum {
            return self.become_leader();
        }
        Ok(Vec::new())
    }

    fn handle_append_entries(
        &mut self,
        term: Term,
        leader: NodeId,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<Entry>,
        leader_commit: Index,
    ) -> CResult<Vec<(NodeId, Message)>> {
        let current_term = self.current_term();
        if term < current_term {
            return Ok(vec![(leader, Message::AppendEntriesResponse { term: current_term, success: false, match_index: 0 })]);
        }

        self.role = Role::Follower { leader: Some(leader) };
        self.election_elapsed = 0;

        if prev_log_index > 0 && !self.log.has(prev_log_index, prev_log_term)? {
            return Ok(vec![(leader, Message::AppendEntriesResponse { term: current_term, success: false, match_index: 0 })]);
        }

        self.log.splice(entries)?;
        let (last_index, _) = self.log.get_last_index();
        if leader_commit > self.commit_index() {
            self.log.commit(leader_commit.min(last_index))?;
        }
        Ok(vec![(leader, Message::AppendEntriesResponse { term: current_term, success: true, match_index: last_index })])
    }

    fn handle_append_entries_response(&mut self, from: NodeId, term: Term, success: bool, match_index: Index) -> CResult<Vec<(NodeId, Message)>> {
        if term != self.log.get_term_vote().0 {
            return Ok(Vec::new());
        }

        {
            let Role::Leader { next_index, match_index: match_indexes } = &mut self.role else { return Ok(Vec::new()) };
            if !success {
                let next = next_index.entry(from).or_insert(1);
                *next = next.saturating_sub(1).max(1);
            } else {
                next_index.insert(from, match_index + 1);
                match_indexes.insert(from, match_index);
            }
        }

        if !success {
            return self.retry_append(from);
        }
        self.advance_commit()?;
        Ok(Vec::new())
    }

    fn retry_append(&mut self, peer: NodeId) -> CResult<Vec<(NodeId, Message)>> {
        let Role::Leader { next_index, .. } = &self.role else { return Ok(Vec::new()) };
        let term = self.current_term();
        let leader_commit = self.commit_index();
        let next = *next_index.get(&peer).unwrap_or(&1);
        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = if prev_log_index == 0 { 0 } else { self.log.get(prev_log_index)?.map(|e| e.term).unwrap_or(0) };
        let entries = self.log.scan(next, self.log.get_last_index().0)?;
        Ok(vec![(peer, Message::AppendEntries { term, leader: self.id, prev_log_index, prev_log_term, entries, leader_commit })])
    }
}
