//! Settings a frontend constructs and hands to a node at startup. The core
//! library doesn't own process configuration -- no file format, no env var
//! parsing -- so this is a plain struct with a sane [`Default`] and
//! builder-style overrides, the way `ConfigLoad` holds settings for the
//! teacher's CLI without this crate needing to know how they got there.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::storage::memory::MemoryEngine;
use crate::storage::log_cask::LogCaskEngine;
use crate::storage::StorageEngine;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of voting members expected in the cluster. Used only to size
    /// connection pools and sanity-check peer lists; `RaftNode` itself infers
    /// quorum from however many peers it was actually constructed with.
    pub cluster_size: usize,
    /// Trigger compaction once the revision store has grown this many
    /// writes past the last compaction point. `0` disables automatic
    /// compaction -- a caller must call it explicitly.
    pub snapshot_threshold: u64,
    /// Override for `WATCH_CHANNEL_CAPACITY`; `None` keeps the built-in
    /// default.
    pub watch_queue_limit: Option<usize>,
    /// How many committed ticks between `Command::Tick` proposals, i.e. the
    /// lease-expiry scan interval.
    pub lease_scan_interval_ticks: i64,
    /// Where `LogCaskEngine` and `FileRaftLog` keep their files. `None`
    /// means in-memory only (tests, ephemeral nodes).
    pub storage_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self { cluster_size: 1, snapshot_threshold: 10_000, watch_queue_limit: None, lease_scan_interval_ticks: 1, storage_path: None }
    }
}

impl Config {
    pub fn with_cluster_size(mut self, cluster_size: usize) -> Self {
        self.cluster_size = cluster_size;
        self
    }

    pub fn with_snapshot_threshold(mut self, snapshot_threshold: u64) -> Self {
        self.snapshot_threshold = snapshot_threshold;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_watch_queue_limit(mut self, limit: usize) -> Self {
        self.watch_queue_limit = Some(limit);
        self
    }

    pub fn with_lease_scan_interval_ticks(mut self, ticks: i64) -> Self {
        self.lease_scan_interval_ticks = ticks;
        self
    }

    /// Opens the engine backing a component named `name` ("kv", "raft"):
    /// in-memory if `storage_path` is unset, otherwise a `LogCaskEngine`
    /// file under it. Two components share a `storage_path` but never a
    /// file, so a node typically calls this twice with two different names.
    pub fn open_storage(&self, name: &str) -> CResult<StorageEngine> {
        match &self.storage_path {
            None => Ok(StorageEngine::Memory(MemoryEngine::new())),
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(StorageEngine::Cask(LogCaskEngine::new(dir.join(name))?))
            }
        }
    }
}
