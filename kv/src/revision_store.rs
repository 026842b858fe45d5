//! Maps a [`Revision`] to the [`KeyValue`] record written at it. Backed by a
//! [`PersistentKV`] engine; the physical key is the revision's own 16-byte
//! encoding, so entries land in commit order regardless of which user key
//! they belong to. [`KeyIndex`](crate::keyindex::KeyIndex) is what lets a
//! caller find a user key's revisions in the first place -- this store only
//! ever resolves a revision it was already given one.

use std::collections::HashSet;

use crate::error::{CResult, Error};
use crate::revision::Revision;
use crate::storage::engine::PersistentKV;
use crate::types::KeyValue;

pub struct RevisionStore<E: PersistentKV> {
    engine: E,
}

impl<E: PersistentKV> RevisionStore<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn write(&mut self, rev: Revision, kv: &KeyValue) -> CResult<()> {
        let bytes = bincode::serialize(kv)?;
        self.engine.set(&rev.encode(), bytes)
    }

    /// Reads the record written at `rev`. `compacted_revision` is the
    /// caller's current compaction watermark, used to distinguish "reclaimed
    /// by compaction" from a revision that plain never existed.
    pub fn read(&mut self, rev: Revision, compacted_revision: i64) -> CResult<KeyValue> {
        match self.engine.get(&rev.encode())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None if rev.main < compacted_revision => {
                Err(Error::Compacted { requested: rev.main, compacted: compacted_revision })
            }
            None => Err(Error::NotFound(format!("revision {rev}"))),
        }
    }

    /// Full scan filtered to records for `key`. Everyday point reads go
    /// through `KeyIndex` to a single `read` instead; this is for cold-start
    /// index rebuild and for replaying a single key's history to a watcher.
    pub fn scan_for_key(&mut self, key: &[u8]) -> CResult<Vec<(Revision, KeyValue)>> {
        let mut out = Vec::new();
        for entry in self.engine.scan(..) {
            let (raw_key, bytes) = entry?;
            let rev = Revision::decode(&raw_key)
                .ok_or_else(|| Error::Internal("corrupt revision key in store".into()))?;
            let kv: KeyValue = bincode::deserialize(&bytes)?;
            if kv.key == key {
                out.push((rev, kv));
            }
        }
        Ok(out)
    }

    /// Every `(revision, KeyValue)` pair on disk, in revision order. Used to
    /// rebuild the in-memory `KeyIndex` after a restart.
    pub fn scan_all(&mut self) -> CResult<Vec<(Revision, KeyValue)>> {
        let mut out = Vec::new();
        for entry in self.engine.scan(..) {
            let (raw_key, bytes) = entry?;
            let rev = Revision::decode(&raw_key)
                .ok_or_else(|| Error::Internal("corrupt revision key in store".into()))?;
            let kv: KeyValue = bincode::deserialize(&bytes)?;
            out.push((rev, kv));
        }
        Ok(out)
    }

    /// Physically removes every record at a revision strictly less than
    /// `boundary`, except those named in `preserve`. `preserve` holds the
    /// revisions `KeyIndex::compact` decided to keep as the last known value
    /// for a still-live key.
    pub fn delete_older_than(&mut self, boundary: Revision, preserve: &HashSet<Revision>) -> CResult<u64> {
        let mut to_delete = Vec::new();
        for entry in self.engine.scan(..boundary.encode().to_vec()) {
            let (raw_key, _) = entry?;
            let rev = Revision::decode(&raw_key)
                .ok_or_else(|| Error::Internal("corrupt revision key in store".into()))?;
            if !preserve.contains(&rev) {
                to_delete.push(raw_key);
            }
        }
        let count = to_delete.len() as u64;
        for key in to_delete {
            self.engine.delete(&key)?;
        }
        Ok(count)
    }

    pub fn flush(&mut self) -> CResult<()> {
        self.engine.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryEngine;

    fn kv(key: &str, value: &str, rev: i64) -> KeyValue {
        KeyValue {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            create_revision: rev,
            mod_revision: rev,
            version: 1,
            lease: 0,
        }
    }

    #[test]
    fn write_then_read_round_trips() -> CResult<()> {
        let mut store = RevisionStore::new(MemoryEngine::new());
        let rev = Revision::new(1, 0);
        store.write(rev, &kv("a", "1", 1))?;
        assert_eq!(store.read(rev, 0)?.value, b"1");
        Ok(())
    }

    #[test]
    fn read_missing_below_watermark_is_compacted() -> CResult<()> {
        let mut store = RevisionStore::<MemoryEngine>::new(MemoryEngine::new());
        let err = store.read(Revision::new(3, 0), 5).unwrap_err();
        assert!(matches!(err, Error::Compacted { requested: 3, compacted: 5 }));
        Ok(())
    }

    #[test]
    fn read_missing_above_watermark_is_not_found() -> CResult<()> {
        let mut store = RevisionStore::<MemoryEngine>::new(MemoryEngine::new());
        let err = store.read(Revision::new(3, 0), 1).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }

    #[test]
    fn scan_for_key_filters_by_logical_key() -> CResult<()> {
        let mut store = RevisionStore::new(MemoryEngine::new());
        store.write(Revision::new(1, 0), &kv("a", "1", 1))?;
        store.write(Revision::new(2, 0), &kv("b", "1", 2))?;
        store.write(Revision::new(3, 0), &kv("a", "2", 3))?;

        let found = store.scan_for_key(b"a")?;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, Revision::new(1, 0));
        assert_eq!(found[1].0, Revision::new(3, 0));
        Ok(())
    }

    #[test]
    fn delete_older_than_respects_preserve_set() -> CResult<()> {
        let mut store = RevisionStore::new(MemoryEngine::new());
        let r1 = Revision::new(1, 0);
        let r2 = Revision::new(2, 0);
        let r3 = Revision::new(3, 0);
        store.write(r1, &kv("a", "1", 1))?;
        store.write(r2, &kv("b", "1", 2))?;
        store.write(r3, &kv("c", "1", 3))?;

        let mut preserve = HashSet::new();
        preserve.insert(r2);

        let deleted = store.delete_older_than(r3, &preserve)?;
        assert_eq!(deleted, 1); // only r1 falls below the boundary and isn't preserved

        assert!(store.read(r1, 0).is_err());
        assert_eq!(store.read(r2, 0)?.value, b"1");
        assert_eq!(store.read(r3, 0)?.value, b"1");
        Ok(())
    }
}
