//! How a node sends and receives [`Envelope`]s. Mirrors the
//! trait-plus-throwaway-impl split used for the storage backend
//! ([`crate::storage::engine::PersistentKV`] / [`crate::storage::memory::MemoryEngine`]):
//! production wiring picks a real implementation, tests use [`InProcessTransport`].

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};

use super::message::{Envelope, Message};
use super::NodeId;

pub trait Transport: Send {
    fn send(&self, to: NodeId, message: Message) -> CResult<()>;

    /// Drains and returns every envelope addressed to this node that has
    /// arrived since the last call. Never blocks.
    fn receive(&self) -> CResult<Vec<Envelope>>;
}

/// An unbounded in-process network for tests: every node gets a channel, and
/// `send` just posts onto the recipient's. No drops, no reordering within a
/// sender -- real networks give weaker guarantees, so node logic must never
/// rely on what this happens to provide.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    senders: Arc<Mutex<HashMap<NodeId, Sender<Envelope>>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns its transport handle. Call once per node
    /// before wiring up any other node's transport, so every peer can find
    /// this one's sender.
    pub fn register(&self, id: NodeId) -> InProcessTransport {
        let (tx, rx) = std::sync::mpsc::channel();
        self.senders.lock().unwrap().insert(id, tx);
        InProcessTransport { id, network: self.clone(), receiver: Mutex::new(rx) }
    }
}

pub struct InProcessTransport {
    id: NodeId,
    network: InProcessNetwork,
    receiver: Mutex<Receiver<Envelope>>,
}

impl Transport for InProcessTransport {
    fn send(&self, to: NodeId, message: Message) -> CResult<()> {
        let senders = self.network.senders.lock().unwrap();
        let Some(tx) = senders.get(&to) else {
            return Err(Error::Unavailable(format!("no route to node {to}")));
        };
        tx.send(Envelope { from: self.id, to, message })
            .map_err(|_| Error::Unavailable(format!("node {to} disconnected")))
    }

    fn receive(&self) -> CResult<Vec<Envelope>> {
        let rx = self.receiver.lock().unwrap();
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(envelope) => out.push(envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(out)
    }
}
