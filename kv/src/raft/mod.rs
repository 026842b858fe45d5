//! Raft consensus: leader election and log replication, so every node in
//! the cluster applies [`crate::pipeline::Command`]s from the same log in
//! the same order. [`node::RaftNode`] is the state machine; [`log::FileRaftLog`]
//! is its durable storage; [`message::Message`] is the wire protocol;
//! [`transport::Transport`] is how messages actually move between nodes.

pub mod log;
pub mod message;
pub mod node;
pub mod transport;

pub use node::RaftNode;

pub type NodeId = u64;
pub type Term = u64;
