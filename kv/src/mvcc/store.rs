//! The multi-version store: the single-threaded combination of a
//! [`KeyIndex`] (which revision is current for a key) and a
//! [`RevisionStore`] (what was written at a revision). Everything here runs
//! on the apply path -- one [`MVCCStore`] per node, driven serially as
//! commands commit through Raft, the same way the teacher drove its engine
//! through a single `Arc<Mutex<E>>`.

use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::keyindex::KeyIndex;
use crate::revision::{Revision, RevisionGenerator, ZERO};
use crate::revision_store::RevisionStore;
use crate::storage::engine::PersistentKV;
use crate::types::{EventType, KeyValue, WatchEvent};

/// Engine-level status, mirroring what a client-facing status RPC reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub current_revision: i64,
    pub compacted_revision: i64,
    pub total_keys: u64,
}

pub struct MVCCStore<E: PersistentKV> {
    revisions: RevisionStore<E>,
    index: KeyIndex,
    revgen: RevisionGenerator,
    compacted_revision: i64,
}

impl<E: PersistentKV> MVCCStore<E> {
    pub fn new(engine: E) -> Self {
        Self {
            revisions: RevisionStore::new(engine),
            index: KeyIndex::new(),
            revgen: RevisionGenerator::new(),
            compacted_revision: 0,
        }
    }

    /// Rebuilds the index from every record on disk. Run once at startup
    /// before the node starts applying new commands.
    pub fn restore(engine: E) -> CResult<Self> {
        let mut revisions = RevisionStore::new(engine);
        let mut records = revisions.scan_all()?;
        records.sort_by_key(|(rev, _)| *rev);
        let last_rev = records.last().map(|(rev, _)| *rev).unwrap_or(ZERO);
        let index = KeyIndex::rebuild_from(
            records.into_iter().map(|(rev, kv)| (kv.key.clone(), rev, kv.is_tombstone())),
        );
        Ok(Self { revisions, index, revgen: RevisionGenerator::resume_at(last_rev), compacted_revision: 0 })
    }

    /// Every `(revision, KeyValue)` record currently on disk, for building a
    /// snapshot to send a lagging follower.
    pub fn all_records(&mut self) -> CResult<Vec<(Revision, KeyValue)>> {
        self.revisions.scan_all()
    }

    /// Replaces this store's entire state with a snapshot taken elsewhere --
    /// a follower installing what the leader sent instead of replaying its
    /// log from scratch. `records` become the whole revision history; any
    /// data this store already had is superseded, not merged.
    pub fn install_snapshot(&mut self, current_revision: Revision, compacted_revision: i64, records: Vec<(Revision, KeyValue)>) -> CResult<()> {
        for (rev, kv) in &records {
            self.revisions.write(*rev, kv)?;
        }
        self.index =
            KeyIndex::rebuild_from(records.into_iter().map(|(rev, kv)| (kv.key.clone(), rev, kv.is_tombstone())));
        self.revgen = RevisionGenerator::resume_at(current_revision);
        self.compacted_revision = compacted_revision;
        Ok(())
    }

    /// Opens a new commit batch, minting the `main` revision every operation
    /// in it will share. Call once per applied Raft entry, then `put`/
    /// `delete` once per operation inside it.
    pub fn begin(&mut self) -> Revision {
        self.revgen.next_main()
    }

    pub fn current_revision(&self) -> Revision {
        self.revgen.current()
    }

    pub fn compacted_revision(&self) -> i64 {
        self.compacted_revision
    }

    fn check_bound(&self, at_rev: Revision) -> CResult<Revision> {
        if at_rev.is_zero() {
            return Ok(self.revgen.current());
        }
        if at_rev.main < self.compacted_revision {
            return Err(Error::Compacted { requested: at_rev.main, compacted: self.compacted_revision });
        }
        if at_rev.main > self.revgen.current().main {
            return Err(Error::FutureRevision { requested: at_rev.main, current: self.revgen.current().main });
        }
        Ok(at_rev)
    }

    pub fn get(&mut self, key: &[u8], at_rev: Revision) -> CResult<Option<KeyValue>> {
        let bound = self.check_bound(at_rev)?;
        let rev = self.index.find_revision(key, bound);
        if rev.is_zero() {
            return Ok(None);
        }
        Ok(Some(self.revisions.read(rev, self.compacted_revision)?))
    }

    /// Ascends `[start, end)` as of `at_rev` (etcd's empty-`end` convention:
    /// a single key). `limit == 0` means unbounded.
    pub fn range(&mut self, start: &[u8], end: &[u8], at_rev: Revision, limit: usize) -> CResult<Vec<KeyValue>> {
        let bound = self.check_bound(at_rev)?;
        let mut hits = Vec::new();
        self.index.range(start, end, bound, |_key, rev| {
            hits.push(rev);
            limit == 0 || hits.len() < limit
        });
        hits.into_iter().map(|rev| self.revisions.read(rev, self.compacted_revision)).collect()
    }

    /// Writes `key = value` as one operation of the batch opened by the last
    /// `begin`. Returns the watch event for the write.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>, lease: i64) -> CResult<WatchEvent> {
        let rev = self.revgen.next_sub();
        let current = self.index.find_revision(key, ZERO);
        let prev_kv = if current.is_zero() { None } else { Some(self.revisions.read(current, self.compacted_revision)?) };

        let create_revision = prev_kv.as_ref().map(|p| p.create_revision).unwrap_or(rev.main);
        let version = prev_kv.as_ref().map(|p| p.version + 1).unwrap_or(1);

        let kv = KeyValue { key: key.to_vec(), value, create_revision, mod_revision: rev.main, version, lease };
        self.revisions.write(rev, &kv)?;
        self.index.put(key, rev);

        Ok(WatchEvent { event_type: EventType::Put, kv, prev_kv, revision: rev })
    }

    /// Deletes `key` as one operation of the current batch. Returns `None`
    /// if the key did not exist.
    pub fn delete(&mut self, key: &[u8]) -> CResult<Option<WatchEvent>> {
        let current = self.index.find_revision(key, ZERO);
        if current.is_zero() {
            return Ok(None);
        }
        let prev_kv = self.revisions.read(current, self.compacted_revision)?;

        let rev = self.revgen.next_sub();
        let tombstone = KeyValue::tombstone(key.to_vec(), rev.main);
        self.revisions.write(rev, &tombstone)?;
        self.index.delete(key, rev);

        Ok(Some(WatchEvent { event_type: EventType::Delete, kv: tombstone, prev_kv: Some(prev_kv), revision: rev }))
    }

    /// Deletes every live key in `[start, end)` as operations of the current
    /// batch. Returns the watch events, in key order.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> CResult<Vec<WatchEvent>> {
        let mut keys = Vec::new();
        self.index.range(start, end, ZERO, |key, _rev| {
            keys.push(key.to_vec());
            true
        });
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(event) = self.delete(&key)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Reclaims every revision strictly below `at_rev`, except the live
    /// value of any key still alive as of `at_rev`. Idempotent: compacting
    /// at or below the current watermark does nothing.
    pub fn compact(&mut self, at_rev: Revision) -> CResult<u64> {
        if at_rev.main <= self.compacted_revision {
            return Ok(0);
        }
        if at_rev.main > self.revgen.current().main {
            return Err(Error::FutureRevision { requested: at_rev.main, current: self.revgen.current().main });
        }
        let preserve = self.index.live_revisions_as_of(at_rev);
        self.index.compact(at_rev);
        let deleted = self.revisions.delete_older_than(at_rev, &preserve)?;
        self.compacted_revision = at_rev.main;
        log::info!("compacted up to revision {}, reclaimed {deleted} records", at_rev.main);
        Ok(deleted)
    }

    pub fn status(&self) -> Status {
        Status {
            current_revision: self.revgen.current().main,
            compacted_revision: self.compacted_revision,
            total_keys: self.index.len() as u64,
        }
    }

    pub fn flush(&mut self) -> CResult<()> {
        self.revisions.flush()
    }

    /// Every write to a key in `[key, range_end)` at or after `start_rev`, in
    /// revision order -- what a catching-up watcher needs replayed before it
    /// can be marked live. `range_end` empty means the single key `key`,
    /// matching the watch request convention.
    pub fn history_since(&mut self, key: &[u8], range_end: &[u8], start_rev: Revision) -> CResult<Vec<WatchEvent>> {
        if start_rev.main < self.compacted_revision {
            return Err(Error::Compacted { requested: start_rev.main, compacted: self.compacted_revision });
        }
        // A single-key watch goes through `scan_for_key`, which only has to
        // look at that key's own records; a range watch has no such shortcut
        // and falls back to a full scan filtered by key range.
        let mut records = if range_end.is_empty() {
            self.revisions.scan_for_key(key)?
        } else {
            let mut records = self.revisions.scan_all()?;
            records.retain(|(_, kv)| kv.key.as_slice() >= key && kv.key.as_slice() < range_end);
            records
        };
        records.retain(|(rev, _)| *rev >= start_rev);
        records.sort_by_key(|(rev, _)| *rev);
        Ok(records
            .into_iter()
            .map(|(rev, kv)| {
                let event_type = if kv.is_tombstone() { EventType::Delete } else { EventType::Put };
                WatchEvent { event_type, kv, prev_kv: None, revision: rev }
            })
            .collect())
    }
}

/// A handle shared between the apply loop and anything else (watch fan-out,
/// lease expiry) that needs a consistent read of the store without its own
/// copy of the index.
pub type SharedMVCCStore<E> = Arc<Mutex<MVCCStore<E>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryEngine;

    fn store() -> MVCCStore<MemoryEngine> {
        MVCCStore::new(MemoryEngine::new())
    }

    #[test]
    fn install_snapshot_replaces_state_wholesale() -> CResult<()> {
        let mut source = store();
        source.begin();
        source.put(b"a", b"1".to_vec(), 0)?;
        source.begin();
        source.put(b"b", b"2".to_vec(), 0)?;
        let records = source.all_records()?;
        let current_revision = source.current_revision();

        let mut target = store();
        target.begin();
        target.put(b"stale", b"x".to_vec(), 0)?;
        target.install_snapshot(current_revision, 0, records)?;

        assert_eq!(target.get(b"a", ZERO)?.unwrap().value, b"1");
        assert_eq!(target.get(b"b", ZERO)?.unwrap().value, b"2");
        assert_eq!(target.get(b"stale", ZERO)?, None);
        assert_eq!(target.current_revision(), current_revision);
        Ok(())
    }

    #[test]
    fn put_then_get_returns_latest() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        let kv = s.get(b"a", ZERO)?.unwrap();
        assert_eq!(kv.value, b"1");
        assert_eq!(kv.version, 1);
        assert_eq!(kv.create_revision, 1);
        Ok(())
    }

    #[test]
    fn overwrite_bumps_version_keeps_create_revision() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.begin();
        s.put(b"a", b"2".to_vec(), 0)?;
        let kv = s.get(b"a", ZERO)?.unwrap();
        assert_eq!(kv.value, b"2");
        assert_eq!(kv.version, 2);
        assert_eq!(kv.create_revision, 1);
        Ok(())
    }

    #[test]
    fn delete_then_recreate_resets_version() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.begin();
        s.delete(b"a")?;
        assert!(s.get(b"a", ZERO)?.is_none());

        s.begin();
        s.put(b"a", b"2".to_vec(), 0)?;
        let kv = s.get(b"a", ZERO)?.unwrap();
        assert_eq!(kv.version, 1);
        assert!(kv.create_revision > 1);
        Ok(())
    }

    #[test]
    fn historical_get_sees_pre_delete_value() -> CResult<()> {
        let mut s = store();
        let r1 = s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.begin();
        s.delete(b"a")?;

        assert!(s.get(b"a", ZERO)?.is_none());
        assert_eq!(s.get(b"a", r1)?.unwrap().value, b"1");
        Ok(())
    }

    #[test]
    fn range_returns_live_keys_in_order() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.put(b"b", b"2".to_vec(), 0)?;
        s.begin();
        s.delete(b"a")?;
        s.begin();
        s.put(b"c", b"3".to_vec(), 0)?;

        let kvs = s.range(b"a", b"z", ZERO, 0)?;
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        Ok(())
    }

    #[test]
    fn delete_range_removes_every_live_key_in_bounds() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.put(b"ab", b"2".to_vec(), 0)?;
        s.put(b"b", b"3".to_vec(), 0)?;

        s.begin();
        let events = s.delete_range(b"a", b"b")?;
        assert_eq!(events.len(), 2);
        assert!(s.get(b"a", ZERO)?.is_none());
        assert!(s.get(b"ab", ZERO)?.is_none());
        assert!(s.get(b"b", ZERO)?.is_some());
        Ok(())
    }

    #[test]
    fn compact_reclaims_history_but_keeps_live_value() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.begin();
        s.put(b"a", b"2".to_vec(), 0)?;
        s.begin();
        s.put(b"a", b"3".to_vec(), 0)?;

        let compact_at = s.current_revision();
        s.compact(compact_at)?;

        assert_eq!(s.get(b"a", ZERO)?.unwrap().value, b"3");
        let err = s.get(b"a", Revision::new(1, 0)).unwrap_err();
        assert!(matches!(err, Error::Compacted { .. }));
        Ok(())
    }

    #[test]
    fn get_at_future_revision_errors() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        let err = s.get(b"a", Revision::new(1000, 0)).unwrap_err();
        assert!(matches!(err, Error::FutureRevision { .. }));
        Ok(())
    }

    #[test]
    fn history_since_replays_puts_from_a_prior_revision() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        let r2 = s.begin();
        s.put(b"a", b"2".to_vec(), 0)?;
        s.begin();
        s.put(b"a", b"3".to_vec(), 0)?;

        let history = s.history_since(b"a", b"", r2)?;
        let values: Vec<_> = history.into_iter().map(|e| e.kv.value).collect();
        assert_eq!(values, vec![b"2".to_vec(), b"3".to_vec()]);
        Ok(())
    }

    #[test]
    fn history_since_below_watermark_is_compacted() -> CResult<()> {
        let mut s = store();
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.begin();
        s.put(b"a", b"2".to_vec(), 0)?;
        let compact_at = s.current_revision();
        s.compact(compact_at)?;

        let err = s.history_since(b"a", b"", Revision::new(1, 0)).unwrap_err();
        assert!(matches!(err, Error::Compacted { .. }));
        Ok(())
    }

    #[test]
    fn restore_rebuilds_index_from_disk() -> CResult<()> {
        let engine = MemoryEngine::new();
        let mut s = MVCCStore::new(engine);
        s.begin();
        s.put(b"a", b"1".to_vec(), 0)?;
        s.begin();
        s.delete(b"a")?;
        s.begin();
        s.put(b"b", b"2".to_vec(), 0)?;

        // Reconstruct over the same underlying records, simulating a restart.
        let mut records = s.revisions.scan_all()?;
        records.sort_by_key(|(rev, _)| *rev);
        let rebuilt = crate::keyindex::KeyIndex::rebuild_from(
            records.into_iter().map(|(rev, kv)| {
                let is_tombstone = kv.is_tombstone();
                (kv.key, rev, is_tombstone)
            }),
        );
        assert!(rebuilt.find_revision(b"a", ZERO).is_zero());
        assert!(!rebuilt.find_revision(b"b", ZERO).is_zero());
        Ok(())
    }
}
