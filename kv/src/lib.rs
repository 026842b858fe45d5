//! A replicated, strongly-consistent key-value store with etcd-style MVCC
//! semantics: every mutation is visible at a monotonically increasing
//! `(main, sub)` revision, old revisions stay readable until explicitly
//! compacted, and writes only commit once replicated to a Raft quorum.
//!
//! ## Layout
//!
//! - [`storage`] -- the durable byte-oriented backend ([`storage::engine::PersistentKV`])
//!   and its two implementations, an in-memory map and a bitcask-style log.
//! - [`revision`] / [`keyindex`] / [`revision_store`] -- the MVCC primitives:
//!   revision ordering, the in-memory key index, and the on-disk record store.
//! - [`mvcc`] -- [`mvcc::MVCCStore`], the single-threaded state machine that
//!   ties the above together.
//! - [`lease`], [`watch`], [`txn`] -- TTL-based key expiry, change
//!   subscriptions, and compare-and-swap transactions.
//! - [`pipeline`] -- turns a committed Raft entry into a call into the above.
//! - [`raft`] -- leader election and log replication.
//! - [`cluster`] -- drives a [`raft::RaftNode`] and applies what it commits
//!   to a [`pipeline::CommandPipeline`].
//! - [`snapshot`] -- point-in-time dumps for bringing up lagging followers.
//! - [`config`] -- settings a frontend constructs and hands to a node.
//! - [`error`] -- the shared `Error`/`CResult` types every module returns.

pub mod config;
pub mod error;
pub mod revision;
pub mod types;
pub mod keyindex;
pub mod storage;
pub mod revision_store;
pub mod mvcc;
pub mod lease;
pub mod watch;
pub mod txn;
pub mod pipeline;
pub mod raft;
pub mod cluster;
pub mod snapshot;
