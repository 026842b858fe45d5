pub mod engine;
pub mod log;
pub mod log_cask;
pub mod memory;

use serde_derive::{Deserialize, Serialize};
use crate::error::CResult;
use crate::storage::engine::PersistentKV;
use crate::storage::log_cask::LogCaskEngine;
use crate::storage::memory::MemoryEngine;

/// An in-memory map from physical key to the `(value_pos, value_len)` of its
/// latest entry in the log file. Rebuilt from the log on open, ordered so it
/// can be walked for compaction.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// Status of a storage engine instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIteratorT: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> {}

impl<I: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>>> ScanIteratorT for I {}

/// Picks a durable engine when a node is configured with a storage path, an
/// in-memory one otherwise. Lets a caller hold a single concrete type across
/// both outcomes -- `Config::open_storage` is what actually decides which
/// variant to build.
pub enum StorageEngine {
    Memory(MemoryEngine),
    Cask(LogCaskEngine),
}

impl std::fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(e) => e.fmt(f),
            Self::Cask(e) => e.fmt(f),
        }
    }
}

impl PersistentKV for StorageEngine {
    type ScanIterator<'a> = Box<dyn ScanIteratorT + 'a>;

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        match self {
            Self::Memory(e) => e.delete(key),
            Self::Cask(e) => e.delete(key),
        }
    }

    fn flush(&mut self) -> CResult<()> {
        match self {
            Self::Memory(e) => e.flush(),
            Self::Cask(e) => e.flush(),
        }
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        match self {
            Self::Memory(e) => e.get(key),
            Self::Cask(e) => e.get(key),
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        let range = (range.start_bound().cloned(), range.end_bound().cloned());
        self.scan_dyn(range)
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_> {
        match self {
            Self::Memory(e) => e.scan_dyn(range),
            Self::Cask(e) => e.scan_dyn(range),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        match self {
            Self::Memory(e) => e.set(key, value),
            Self::Cask(e) => e.set(key, value),
        }
    }

    fn status(&mut self) -> CResult<Status> {
        match self {
            Self::Memory(e) => e.status(),
            Self::Cask(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CResult;
    use crate::storage::engine::PersistentKV;
    use crate::storage::{memory::MemoryEngine, StorageEngine};

    #[test]
    fn storage_engine_memory_variant_delegates() -> CResult<()> {
        let mut s = StorageEngine::Memory(MemoryEngine::new());
        s.set(b"a", vec![1])?;
        assert_eq!(s.get(b"a")?, Some(vec![1]));
        s.delete(b"a")?;
        assert_eq!(s.get(b"a")?, None);
        Ok(())
    }

    #[track_caller]
    pub(crate) fn assert_scan<I>(iter: I, expect: Vec<(&[u8], Vec<u8>)>) -> CResult<()>
    where
        I: Iterator<Item = CResult<(Vec<u8>, Vec<u8>)>>,
    {
        assert_eq!(
            iter.collect::<CResult<Vec<_>>>()?,
            expect.into_iter().map(|(k, v)| (k.to_vec(), v)).collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Generates common tests for any `PersistentKV` implementation.
    macro_rules! test_engine {
        ($setup:expr) => {
            #[test]
            fn point_ops() -> CResult<()> {
                let mut s = $setup;

                assert_eq!(s.get(b"a")?, None);

                s.set(b"a", vec![1])?;
                assert_eq!(s.get(b"a")?, Some(vec![1]));

                s.set(b"b", vec![2])?;
                assert_eq!(s.get(b"b")?, Some(vec![2]));
                assert_eq!(s.get(b"a")?, Some(vec![1]));

                assert_eq!(s.get(b"c")?, None);

                s.set(b"a", vec![0])?;
                assert_eq!(s.get(b"a")?, Some(vec![0]));

                s.delete(b"a")?;
                assert_eq!(s.get(b"a")?, None);
                assert_eq!(s.get(b"b")?, Some(vec![2]));

                // Deletes are idempotent.
                s.delete(b"a")?;
                assert_eq!(s.get(b"a")?, None);

                Ok(())
            }

            #[test]
            fn point_ops_empty() -> CResult<()> {
                let mut s = $setup;
                assert_eq!(s.get(b"")?, None);
                s.set(b"", vec![])?;
                assert_eq!(s.get(b"")?, Some(vec![]));
                s.delete(b"")?;
                assert_eq!(s.get(b"")?, None);
                Ok(())
            }

            #[test]
            fn point_ops_sizes() -> CResult<()> {
                let mut s = $setup;
                for size in (1..=20).map(|i| 1 << i) {
                    let bytes = "x".repeat(size);
                    let key = bytes.as_bytes();
                    let value = bytes.clone().into_bytes();

                    assert_eq!(s.get(key)?, None);
                    s.set(key, value.clone())?;
                    assert_eq!(s.get(key)?, Some(value));
                    s.delete(key)?;
                    assert_eq!(s.get(key)?, None);
                }
                Ok(())
            }

            #[test]
            fn scan() -> CResult<()> {
                let mut s = $setup;
                s.set(b"a", vec![1])?;
                s.set(b"b", vec![2])?;
                s.set(b"ba", vec![2, 1])?;
                s.set(b"bb", vec![2, 2])?;
                s.set(b"c", vec![3])?;

                crate::storage::tests::assert_scan(
                    s.scan(b"b".to_vec()..b"bz".to_vec()),
                    vec![(b"b", vec![2]), (b"ba", vec![2, 1]), (b"bb", vec![2, 2])],
                )?;
                crate::storage::tests::assert_scan(
                    s.scan(b"b".to_vec()..b"bz".to_vec()).rev(),
                    vec![(b"bb", vec![2, 2]), (b"ba", vec![2, 1]), (b"b", vec![2])],
                )?;
                crate::storage::tests::assert_scan(
                    s.scan(b"b".to_vec()..b"bb".to_vec()),
                    vec![(b"b", vec![2]), (b"ba", vec![2, 1])],
                )?;
                crate::storage::tests::assert_scan(
                    s.scan(b"bb".to_vec()..),
                    vec![(b"bb", vec![2, 2]), (b"c", vec![3])],
                )?;
                crate::storage::tests::assert_scan(
                    s.scan(..),
                    vec![
                        (b"a", vec![1]),
                        (b"b", vec![2]),
                        (b"ba", vec![2, 1]),
                        (b"bb", vec![2, 2]),
                        (b"c", vec![3]),
                    ],
                )?;
                Ok(())
            }

            #[test]
            fn scan_prefix() -> CResult<()> {
                let mut s = $setup;
                s.set(b"a", vec![1])?;
                s.set(b"b", vec![2])?;
                s.set(b"ba", vec![2, 1])?;
                s.set(b"bb", vec![2, 2])?;
                s.set(b"c", vec![3])?;

                crate::storage::tests::assert_scan(
                    s.scan_prefix(b"b"),
                    vec![(b"b", vec![2]), (b"ba", vec![2, 1]), (b"bb", vec![2, 2])],
                )?;
                crate::storage::tests::assert_scan(s.scan_prefix(b"bb"), vec![(b"bb", vec![2, 2])])?;
                crate::storage::tests::assert_scan(s.scan_prefix(b"bq"), vec![])?;
                Ok(())
            }

            #[test]
            fn random_ops() -> CResult<()> {
                const NUM_OPS: u64 = 500;

                use rand::{seq::SliceRandom, Rng, RngCore};
                let seed: u64 = rand::thread_rng().gen();
                let mut rng: rand::rngs::StdRng = rand::SeedableRng::seed_from_u64(seed);

                #[derive(Debug)]
                enum Op {
                    Set,
                    Delete,
                    Get,
                }

                impl rand::distributions::Distribution<Op> for rand::distributions::Standard {
                    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Op {
                        match rng.gen_range(0..=2) {
                            0 => Op::Set,
                            1 => Op::Delete,
                            _ => Op::Get,
                        }
                    }
                }

                let mut s = $setup;
                let mut keys: Vec<Vec<u8>> = Vec::new();
                let mut m = std::collections::BTreeMap::new();

                let mut random_key = |mut rng: &mut rand::rngs::StdRng| -> Vec<u8> {
                    if rng.gen::<f64>() < 0.8 && !keys.is_empty() {
                        keys.choose(&mut rng).unwrap().clone()
                    } else {
                        let mut key = vec![0; rng.gen_range(0..=16)];
                        rng.fill_bytes(&mut key);
                        keys.push(key.clone());
                        key
                    }
                };
                let random_value = |rng: &mut rand::rngs::StdRng| -> Vec<u8> {
                    let mut value = vec![0; rng.gen_range(0..=16)];
                    rng.fill_bytes(&mut value);
                    value
                };

                for _ in 0..NUM_OPS {
                    match rng.gen::<Op>() {
                        Op::Set => {
                            let key = random_key(&mut rng);
                            let value = random_value(&mut rng);
                            s.set(&key, value.clone())?;
                            m.insert(key, value);
                        }
                        Op::Delete => {
                            let key = random_key(&mut rng);
                            s.delete(&key)?;
                            m.remove(&key);
                        }
                        Op::Get => {
                            let key = random_key(&mut rng);
                            assert_eq!(s.get(&key)?, m.get(&key).cloned());
                        }
                    }
                }

                let state = s.scan(..).collect::<CResult<Vec<_>>>()?;
                let expect = m.range::<Vec<u8>, _>(..).map(|(k, v)| (k.clone(), v.clone())).collect::<Vec<_>>();
                assert_eq!(state, expect);

                Ok(())
            }

            #[test]
            fn status() -> CResult<()> {
                let mut s = $setup;
                s.set(b"foo", vec![1, 2, 3])?;
                s.set(b"bar", vec![1])?;
                s.delete(b"bar")?;
                s.set(b"baz", vec![1])?;
                s.set(b"baz", vec![2])?;
                s.set(b"baz", vec![3])?;
                s.delete(b"qux")?;

                let status = s.status()?;
                assert!(!status.name.is_empty());
                assert_eq!(status.keys, 2);
                assert_eq!(status.size, 10);

                Ok(())
            }
        };
    }

    pub(super) use test_engine;
}
