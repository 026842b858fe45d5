//! The wire messages exchanged between nodes. Bincode-encoded and carried by
//! whatever [`super::transport::Transport`] the node is configured with --
//! in-process channels in tests, a real socket in production.

use serde_derive::{Deserialize, Serialize};

use super::log::{Entry, Index};
use super::{NodeId, Term};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Sent by a candidate to solicit votes.
    RequestVote { term: Term, candidate: NodeId, last_log_index: Index, last_log_term: Term },
    RequestVoteResponse { term: Term, vote_granted: bool },
    /// Sent by a leader to replicate entries (or, with `entries` empty, as a
    /// heartbeat). `prev_log_index`/`prev_log_term` identify the entry
    /// immediately before `entries`, for the follower's consistency check.
    AppendEntries {
        term: Term,
        leader: NodeId,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<Entry>,
        leader_commit: Index,
    },
    AppendEntriesResponse {
        term: Term,
        /// `false` means the consistency check at `prev_log_index` failed;
        /// the leader should retry with an earlier `prev_log_index`.
        success: bool,
        /// The follower's last log index after applying this message, valid
        /// only when `success` is true -- lets the leader advance
        /// `match_index` in one round trip instead of one entry at a time.
        match_index: Index,
    },
}

/// An addressed message, as handed to and received from a [`super::transport::Transport`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> crate::error::CResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::error::CResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
