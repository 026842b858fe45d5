//! The in-memory ordered index of keys -> generations -> revisions.
//!
//! Keyed by user-key bytes in lexicographic order (a `BTreeMap`, the same
//! choice the teacher's `storage::KeyDir` makes for its on-disk offset
//! index). `RevisionStore` holds the materialized values; `KeyIndex` only
//! tracks which revisions exist for which key and in what generation.

use std::collections::{BTreeMap, HashSet};

use serde_derive::{Deserialize, Serialize};

use crate::revision::{Revision, ZERO};

/// A lifetime of a key between deletions. `revisions` is sorted ascending.
/// A tombstone is modeled as an empty generation appended immediately after
/// the delete revision -- see [`KeyIndex::delete`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub created: Revision,
    pub revisions: Vec<Revision>,
}

impl Generation {
    fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}

/// Exists in the index iff the key has ever been written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyItem {
    pub key: Vec<u8>,
    pub generations: Vec<Generation>,
    pub modified: Revision,
}

impl KeyItem {
    fn is_currently_deleted(&self) -> bool {
        match self.generations.last() {
            None => true,
            Some(Generation { revisions, .. }) => revisions.is_empty(),
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyIndex {
    items: BTreeMap<Vec<u8>, KeyItem>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self { items: BTreeMap::new() }
    }

    /// Rebuilds a `KeyIndex` from a revision-ordered stream of `(key,
    /// revision, is_tombstone)` triples, as produced by streaming a
    /// snapshot's `kv_records` in revision order. See `snapshot::restore`.
    pub fn rebuild_from(records: impl Iterator<Item = (Vec<u8>, Revision, bool)>) -> Self {
        let mut index = Self::new();
        for (key, rev, is_tombstone) in records {
            if is_tombstone {
                index.delete(&key, rev);
            } else {
                index.put(&key, rev);
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records a write of `key` at `rev`. Opens a new generation if the key
    /// has no generations yet or its most recent one was closed by a delete.
    pub fn put(&mut self, key: &[u8], rev: Revision) {
        let item = self.items.entry(key.to_vec()).or_insert_with(|| KeyItem {
            key: key.to_vec(),
            generations: Vec::new(),
            modified: ZERO,
        });
        if item.is_currently_deleted() {
            item.generations.push(Generation { created: rev, revisions: vec![rev] });
        } else {
            item.generations.last_mut().expect("non-deleted key has a generation").revisions.push(rev);
        }
        item.modified = rev;
    }

    /// Closes the current generation at `rev` and opens a fresh empty
    /// (tombstone) generation. Returns `false` if the key was already
    /// deleted (or never existed).
    pub fn delete(&mut self, key: &[u8], rev: Revision) -> bool {
        let Some(item) = self.items.get_mut(key) else { return false };
        if item.is_currently_deleted() {
            return false;
        }
        item.generations.last_mut().expect("non-deleted key has a generation").revisions.push(rev);
        item.generations.push(Generation { created: rev, revisions: Vec::new() });
        item.modified = rev;
        true
    }

    /// Resolves the revision at which `key` should be read as of `at_rev`.
    /// `at_rev == ZERO` means "latest". Returns `ZERO` if the key doesn't
    /// exist, or is deleted, as of `at_rev`.
    pub fn find_revision(&self, key: &[u8], at_rev: Revision) -> Revision {
        match self.items.get(key) {
            Some(item) => Self::resolve(item, at_rev),
            None => ZERO,
        }
    }

    fn resolve(item: &KeyItem, at_rev: Revision) -> Revision {
        let bound = if at_rev.is_zero() { Revision::new(i64::MAX, i64::MAX) } else { at_rev };
        for gen in item.generations.iter().rev() {
            if gen.created > bound {
                continue;
            }
            // `gen` is the candidate generation whose lifetime covers `bound`.
            // Binary search its revisions for the largest one <= bound.
            return match gen.revisions.binary_search(&bound) {
                Ok(i) => gen.revisions[i],
                Err(0) => ZERO,
                Err(i) => gen.revisions[i - 1],
            };
        }
        ZERO
    }

    /// Ascends keys in `[start, end)` (or just `start` if `end` is empty --
    /// the etcd "empty range_end means single-key" convention), resolving
    /// each to its revision as of `at_rev` and invoking `callback(key,
    /// resolved_revision)`. Stops early if `callback` returns `false`.
    /// Keys that resolve to `ZERO` (tombstoned or nonexistent at `at_rev`)
    /// are skipped silently.
    pub fn range(
        &self,
        start: &[u8],
        end: &[u8],
        at_rev: Revision,
        mut callback: impl FnMut(&[u8], Revision) -> bool,
    ) {
        if end.is_empty() {
            if let Some(item) = self.items.get(start) {
                let rev = Self::resolve(item, at_rev);
                if !rev.is_zero() {
                    callback(start, rev);
                }
            }
            return;
        }
        for (key, item) in self.items.range(start.to_vec()..end.to_vec()) {
            let rev = Self::resolve(item, at_rev);
            if rev.is_zero() {
                continue;
            }
            if !callback(key, rev) {
                break;
            }
        }
    }

    /// The set of revisions that are each key's live value as of `at_rev`.
    /// Called before `compact` so the caller can tell `RevisionStore` which
    /// on-disk records below the compaction boundary must survive anyway.
    pub fn live_revisions_as_of(&self, at_rev: Revision) -> HashSet<Revision> {
        self.items.values().map(|item| Self::resolve(item, at_rev)).filter(|r| !r.is_zero()).collect()
    }

    /// Discards every revision `< at_rev`, except the newest such revision
    /// of a key's still-live generation (so current reads keep working).
    /// Generations left with no revisions are dropped; a key left with no
    /// generations is removed from the index entirely. Returns the number
    /// of discarded revisions.
    pub fn compact(&mut self, at_rev: Revision) -> usize {
        let mut discarded = 0usize;
        let mut now_empty = Vec::new();
        for (key, item) in self.items.iter_mut() {
            let preserve = Self::resolve(item, at_rev);
            for gen in item.generations.iter_mut() {
                gen.revisions.retain(|&rev| {
                    if rev >= at_rev || rev == preserve {
                        true
                    } else {
                        discarded += 1;
                        false
                    }
                });
            }
            item.generations.retain(|gen| !gen.is_empty());
            if item.generations.is_empty() {
                now_empty.push(key.clone());
            }
        }
        for key in now_empty {
            self.items.remove(&key);
        }
        discarded
    }

    #[cfg(test)]
    pub(crate) fn generations_of(&self, key: &[u8]) -> Option<&[Generation]> {
        self.items.get(key).map(|item| item.generations.as_slice())
    }
}
