//! The replicated log: a sequence of commands, each tagged with the term in
//! which it was proposed, stored durably via a [`PersistentKV`] engine so a
//! restarted node can recover without rejoining the cluster from scratch.
//!
//! Distinct from [`crate::revision_store::RevisionStore`] -- that one stores
//! MVCC records keyed by [`crate::revision::Revision`]; this one stores the
//! consensus log itself, keyed by Raft log index. Both happen to be generic
//! over the same [`PersistentKV`] trait, but a node typically points them at
//! two separate engine instances (and, in production, two separate files).

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::storage::engine::PersistentKV;

use super::{NodeId, Term};

/// A log index. Starts at 1; 0 means "no entry".
pub type Index = u64;

/// One command as proposed by a leader.
///
/// `command: None` is a noop, appended by a freshly elected leader so it can
/// commit entries from earlier terms without waiting for a client write (Raft
/// paper section 5.4.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: Index,
    pub term: Term,
    pub command: Option<Vec<u8>>,
}

fn entry_key(index: Index) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'e');
    key.extend_from_slice(&index.to_be_bytes());
    key
}

const TERM_VOTE_KEY: &[u8] = b"tv";
const COMMIT_INDEX_KEY: &[u8] = b"ci";
const SNAPSHOT_INDEX_KEY: &[u8] = b"si";

/// Invariants this log upholds (mirrors the Raft paper's log matching
/// property):
///
/// * Entry indexes are contiguous starting at 1.
/// * Entry terms never decrease along the log.
/// * Committed entries are never overwritten or truncated.
/// * `splice` only ever replaces the *uncommitted* suffix.
pub struct FileRaftLog<E: PersistentKV> {
    engine: E,
    term: Term,
    vote: Option<NodeId>,
    last_index: Index,
    last_term: Term,
    commit_index: Index,
    commit_term: Term,
    /// The log position a snapshot already covers. Entries at or below this
    /// index have been discarded; `has`/`get` treat `snapshot_index` itself
    /// as a known point rather than a hole.
    snapshot_index: Index,
    snapshot_term: Term,
}

impl<E: PersistentKV> FileRaftLog<E> {
    /// Opens a log backed by `engine`, replaying whatever in-memory summary
    /// (last index/term, commit index, term/vote) it can recover from it.
    pub fn new(mut engine: E) -> CResult<Self> {
        let (term, vote) = engine
            .get(TERM_VOTE_KEY)?
            .map(|v| bincode::deserialize::<(Term, Option<NodeId>)>(&v))
            .transpose()?
            .unwrap_or((0, None));

        let (last_index, last_term) = engine
            .scan(entry_key(0)..=entry_key(Index::MAX))
            .next_back()
            .transpose()?
            .map(|(_, v)| bincode::deserialize::<Entry>(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or((0, 0));

        let (commit_index, commit_term) = engine
            .get(COMMIT_INDEX_KEY)?
            .map(|v| bincode::deserialize::<(Index, Term)>(&v))
            .transpose()?
            .unwrap_or((0, 0));

        let (snapshot_index, snapshot_term) = engine
            .get(SNAPSHOT_INDEX_KEY)?
            .map(|v| bincode::deserialize::<(Index, Term)>(&v))
            .transpose()?
            .unwrap_or((0, 0));

        Ok(Self { engine, term, vote, last_index, last_term, commit_index, commit_term, snapshot_index, snapshot_term })
    }

    pub fn get_term_vote(&self) -> (Term, Option<NodeId>) {
        (self.term, self.vote)
    }

    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    pub fn get_snapshot_index(&self) -> (Index, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    /// Records that a snapshot now covers everything up to `index`,
    /// discarding entries it made redundant. If `index` is ahead of
    /// anything this log has (a follower installing a leader's snapshot
    /// from scratch), the log's tail jumps forward to `index` instead of
    /// trying to preserve entries that no longer share a prefix with the
    /// snapshot.
    pub fn install_snapshot_point(&mut self, index: Index, term: Term) -> CResult<()> {
        if index <= self.snapshot_index {
            return Ok(());
        }
        for i in (self.snapshot_index + 1)..=self.last_index.min(index) {
            self.engine.delete(&entry_key(i))?;
        }
        if index > self.last_index {
            self.last_index = index;
            self.last_term = term;
        }
        if index > self.commit_index {
            self.engine.set(COMMIT_INDEX_KEY, bincode::serialize(&(index, term))?)?;
            self.commit_index = index;
            self.commit_term = term;
        }
        self.engine.set(SNAPSHOT_INDEX_KEY, bincode::serialize(&(index, term))?)?;
        self.engine.flush()?;
        self.snapshot_index = index;
        self.snapshot_term = term;
        Ok(())
    }

    /// Persists the current term and our vote in it. A term may never
    /// regress, and a node votes for at most one candidate per term.
    pub fn set_term_vote(&mut self, term: Term, vote: Option<NodeId>) -> CResult<()> {
        assert!(term >= self.term, "term regression {} -> {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote within a term");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(TERM_VOTE_KEY, bincode::serialize(&(term, vote))?)?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends one entry at `self.term`, flushing before returning so the
    /// leader never reports an index as stored that a crash could still
    /// lose.
    pub fn append(&mut self, command: Option<Vec<u8>>) -> CResult<Index> {
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        self.engine.set(&entry_key(entry.index), bincode::serialize(&entry)?)?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Advances the commit index. The commit index itself need not be
    /// fsynced -- it's recoverable from a quorum of logs after a crash -- but
    /// the entries it points at must already be durable.
    pub fn commit(&mut self, index: Index) -> CResult<Index> {
        if index <= self.commit_index {
            return Ok(self.commit_index);
        }
        let term = self.get(index)?.map(|e| e.term).ok_or_else(|| Error::Internal(format!("commit index {index} does not exist")))?;
        self.engine.set(COMMIT_INDEX_KEY, bincode::serialize(&(index, term))?)?;
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    pub fn get(&mut self, index: Index) -> CResult<Option<Entry>> {
        self.engine.get(&entry_key(index))?.map(|v| Ok(bincode::deserialize(&v)?)).transpose()
    }

    /// Checks whether the log has an entry at `index` with term `term` --
    /// the probe `AppendEntries` uses to find the last point of agreement.
    pub fn has(&mut self, index: Index, term: Term) -> CResult<bool> {
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        if index == self.snapshot_index {
            return Ok(term == self.snapshot_term);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns entries in `[from, to]`, inclusive on both ends.
    pub fn scan(&mut self, from: Index, to: Index) -> CResult<Vec<Entry>> {
        if from > to {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in self.engine.scan(entry_key(from)..=entry_key(to)) {
            let (_, v) = entry?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    /// Entries ready to hand to the state machine: after `applied_index`, up
    /// to the commit index.
    pub fn scan_apply(&mut self, applied_index: Index) -> CResult<Vec<Entry>> {
        if applied_index >= self.commit_index {
            return Ok(Vec::new());
        }
        self.scan(applied_index + 1, self.commit_index)
    }

    /// Splices `entries` into the log: existing entries past the first
    /// conflict are overwritten, anything after the new tail is removed.
    /// Entries that already match what's on disk are left untouched so a
    /// retried `AppendEntries` doesn't re-flush data unnecessarily.
    ///
    /// Never touches indexes at or below the commit index -- committed
    /// entries are immutable by construction, since `splice` is only called
    /// with entries a leader has, and a leader never proposes past what it
    /// already committed for a lower term.
    pub fn splice(&mut self, entries: Vec<Entry>) -> CResult<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index);
        };
        assert!(first.index > self.commit_index, "splice entries at or below commit index");

        let mut entries = entries.as_slice();
        let existing = self.scan(first.index, last.index)?;
        for (i, old) in existing.iter().enumerate() {
            if old.term != entries[i].term {
                break;
            }
            entries = &entries[1..];
        }
        if entries.is_empty() {
            return Ok(self.last_index);
        }

        for entry in entries {
            self.engine.set(&entry_key(entry.index), bincode::serialize(entry)?)?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&entry_key(index))?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    pub fn status(&mut self) -> CResult<crate::storage::Status> {
        self.engine.status()
    }
}
