//! Shared record types threaded through the index, revision store, MVCC
//! store, and watch subsystem.

use serde_derive::{Deserialize, Serialize};

use crate::revision::Revision;

/// A single materialized key/value record at a specific revision.
///
/// `version` counts updates within the current generation; it resets to 0
/// after a delete and becomes 1 on recreate. `lease == 0` means no lease
/// attached. An empty `value` at a revision that starts a fresh (empty)
/// generation marks a tombstone -- see [`KeyValue::is_tombstone`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

impl KeyValue {
    /// A tombstone carries no value and a reset version; it exists purely so
    /// Watch can surface a Delete event at the right revision.
    pub fn tombstone(key: Vec<u8>, mod_revision: i64) -> Self {
        KeyValue { key, value: Vec::new(), create_revision: 0, mod_revision, version: 0, lease: 0 }
    }

    pub fn is_tombstone(&self) -> bool {
        self.version == 0 && self.create_revision == 0
    }
}

/// Event kinds emitted by the MVCC apply path and consumed by the watch
/// subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
    pub revision: Revision,
}
