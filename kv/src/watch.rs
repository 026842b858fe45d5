//! Fan-out of committed writes to watchers, over bounded channels -- the
//! same backpressure-over-correctness tradeoff Xline's `kv_update_tx` makes:
//! a watcher that can't keep up gets cancelled rather than allowed to stall
//! the apply loop or grow its queue without bound.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::{CResult, Error};
use crate::revision::Revision;
use crate::types::WatchEvent;

/// Outbound capacity of a single watcher's channel. Chosen generously for a
/// store expected to run with modest write rates; a watcher that falls this
/// far behind is almost certainly gone, not just slow.
const WATCH_CHANNEL_CAPACITY: usize = 128;

#[derive(Clone, Copy, Debug, Default)]
pub struct WatchFilter {
    pub no_put: bool,
    pub no_delete: bool,
}

impl WatchFilter {
    fn admits(&self, event: &WatchEvent) -> bool {
        match event.event_type {
            crate::types::EventType::Put => !self.no_put,
            crate::types::EventType::Delete => !self.no_delete,
        }
    }
}

pub struct WatchRequest {
    pub key: Vec<u8>,
    /// Empty means single-key, matching the MVCC range convention.
    pub range_end: Vec<u8>,
    /// `ZERO` means "start from now" -- no catch-up replay needed.
    pub start_revision: Revision,
    pub filter: WatchFilter,
    pub send_prev_kv: bool,
}

/// What reaches the watcher over its channel: a real event, a periodic
/// progress marker (used to let a client advance its resume point without
/// traffic on the watched range), or a terminal cancellation with a reason.
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Event(WatchEvent),
    Progress(Revision),
    Canceled(String),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum WatcherState {
    /// Still replaying history up to the revision the watch was created at;
    /// live events are buffered by the apply loop's normal channel send
    /// until `mark_live` is called.
    CatchingUp,
    Live,
    Canceled,
}

struct Watcher {
    key: Vec<u8>,
    range_end: Vec<u8>,
    filter: WatchFilter,
    send_prev_kv: bool,
    state: WatcherState,
    sender: mpsc::Sender<WatchMessage>,
}

impl Watcher {
    fn in_range(&self, key: &[u8]) -> bool {
        if self.range_end.is_empty() {
            key == self.key.as_slice()
        } else {
            key >= self.key.as_slice() && key < self.range_end.as_slice()
        }
    }
}

pub struct WatchManager {
    watchers: HashMap<i64, Watcher>,
    next_id: i64,
    channel_capacity: usize,
}

impl Default for WatchManager {
    fn default() -> Self {
        Self { watchers: HashMap::new(), next_id: 0, channel_capacity: WATCH_CHANNEL_CAPACITY }
    }
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps each watcher's channel at `capacity` instead of the default --
    /// the knob a deployment turns to trade catch-up buffering against
    /// memory when a watcher can fall behind the apply loop.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { channel_capacity: capacity, ..Self::default() }
    }

    /// Registers a watcher and returns its id and the receiving end of its
    /// channel. Starts `CatchingUp` if `start_revision` is non-zero; the
    /// pipeline is responsible for replaying history and then calling
    /// `mark_live`.
    pub fn watch(&mut self, req: WatchRequest) -> (i64, mpsc::Receiver<WatchMessage>) {
        let id = self.next_id;
        self.next_id += 1;
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let state = if req.start_revision.is_zero() { WatcherState::Live } else { WatcherState::CatchingUp };
        self.watchers.insert(
            id,
            Watcher {
                key: req.key,
                range_end: req.range_end,
                filter: req.filter,
                send_prev_kv: req.send_prev_kv,
                state,
                sender,
            },
        );
        (id, receiver)
    }

    /// Delivers buffered historical events to a watcher that is still
    /// `CatchingUp`, bypassing the live-state check `notify` applies. Call
    /// `mark_live` once this returns `Ok` -- a caught-up watcher that never
    /// gets marked live would silently miss every subsequent event.
    pub fn replay(&mut self, id: i64, events: Vec<WatchEvent>) -> CResult<()> {
        let (filter, send_prev_kv) = {
            let w = self.watchers.get(&id).ok_or_else(|| Error::NotFound(format!("watcher {id}")))?;
            (w.filter, w.send_prev_kv)
        };
        for event in events {
            if !filter.admits(&event) {
                continue;
            }
            let mut out = event;
            if !send_prev_kv {
                out.prev_kv = None;
            }
            let sent = self.watchers.get(&id).map(|w| w.sender.try_send(WatchMessage::Event(out)).is_ok());
            match sent {
                Some(true) => {}
                Some(false) => {
                    log::warn!("watcher {id} fell behind during catch-up replay and was dropped");
                    self.cancel(id);
                    return Err(Error::Unavailable(format!("watcher {id} fell behind during catch-up")));
                }
                None => return Err(Error::NotFound(format!("watcher {id}"))),
            }
        }
        Ok(())
    }

    pub fn mark_live(&mut self, id: i64) -> CResult<()> {
        let w = self.watchers.get_mut(&id).ok_or_else(|| Error::NotFound(format!("watcher {id}")))?;
        w.state = WatcherState::Live;
        Ok(())
    }

    pub fn cancel(&mut self, id: i64) {
        self.cancel_with_reason(id, "canceled by client");
    }

    /// Cancels a watcher with a specific reason, e.g. `"compacted"` when its
    /// requested start revision can no longer be replayed.
    pub fn cancel_with_reason(&mut self, id: i64, reason: &str) {
        if let Some(w) = self.watchers.remove(&id) {
            let _ = w.sender.try_send(WatchMessage::Canceled(reason.into()));
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Every registered watcher id, live or still catching up.
    pub fn ids(&self) -> Vec<i64> {
        self.watchers.keys().copied().collect()
    }

    /// Delivers one committed event to every matching, live watcher. A
    /// watcher whose channel is full is cancelled and dropped -- it is
    /// irrecoverably behind, since the apply loop cannot block waiting for a
    /// slow reader.
    pub fn notify(&mut self, event: &WatchEvent) {
        let mut dead = Vec::new();
        for (&id, w) in self.watchers.iter_mut() {
            if w.state != WatcherState::Live || !w.in_range(&event.kv.key) || !w.filter.admits(event) {
                continue;
            }
            let mut out = event.clone();
            if !w.send_prev_kv {
                out.prev_kv = None;
            }
            if w.sender.try_send(WatchMessage::Event(out)).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            if let Some(w) = self.watchers.remove(&id) {
                log::warn!("watcher {id} fell behind and was dropped");
                let _ = w.sender.try_send(WatchMessage::Canceled("watcher fell behind".into()));
            }
        }
    }

    /// Sends a progress marker to every live watcher, letting clients that
    /// watch a quiet range still advance their resume revision.
    pub fn notify_progress(&mut self, at_rev: Revision) {
        let mut dead = Vec::new();
        for (&id, w) in self.watchers.iter() {
            if w.state == WatcherState::Live && w.sender.try_send(WatchMessage::Progress(at_rev)).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.watchers.remove(&id);
        }
    }
}
