//! Turns a committed Raft log entry into a state mutation. One
//! [`CommandPipeline`] per node, driven by `raft::node::RaftNode`'s apply
//! callback -- the single place where `MVCCStore`, `LeaseManager`, and
//! `WatchManager` are mutated together, so a put's watch events and its
//! lease attachment commit atomically with the write itself.

use serde_derive::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{CResult, Error};
use crate::lease::LeaseManager;
use crate::mvcc::store::MVCCStore;
use crate::storage::engine::PersistentKV;
use crate::txn::{self, TxnRequest, TxnResult};
use crate::types::WatchEvent;
use crate::watch::{WatchManager, WatchMessage, WatchRequest};

/// A session's own monotonic counter for deduplicating retried proposals.
/// The leader that first durably commits a given `(session, request_id)`
/// owns the result; a retry after a leadership change replays the cached
/// response instead of re-executing (put would otherwise double-bump the
/// revision and double-consume the lease TTL).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub session: u64,
    pub seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64 },
    Delete { key: Vec<u8> },
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
    Txn(SerializedTxn),
    LeaseGrant { id: i64, ttl_ticks: i64 },
    LeaseRevoke { id: i64 },
    LeaseRenew { id: i64 },
    /// Advances the committed-tick clock every replica uses for lease
    /// expiry. The leader proposes one roughly per heartbeat interval.
    Tick { tick: i64 },
    Compact { at_revision_main: i64 },
}

/// `TxnRequest`'s `Compare`/`Op` trees don't derive `Serialize` directly
/// (they're built fresh per request by the frontend); the pipeline only
/// needs to move them through the log, so `Command::Txn` wraps a pre-built
/// request passed in-process rather than encoding/decoding its tree here.
pub type SerializedTxn = TxnRequest;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: RequestId,
}

#[derive(Debug)]
pub enum CommandResponse {
    Put(WatchEvent),
    Delete(Option<WatchEvent>),
    DeleteRange(Vec<WatchEvent>),
    Txn(TxnResult),
    LeaseGranted(crate::lease::Lease),
    LeaseRevoked(Vec<Vec<u8>>),
    LeaseRenewed { expires_at_tick: i64 },
    Ticked { expired_leases: Vec<i64> },
    Compacted { reclaimed: u64 },
}

const DEDUP_CACHE_CAP: usize = 4096;

pub struct CommandPipeline<E: PersistentKV> {
    pub store: MVCCStore<E>,
    pub leases: LeaseManager,
    pub watches: WatchManager,
    dedup: std::collections::HashMap<RequestId, ()>,
    dedup_order: std::collections::VecDeque<RequestId>,
}

impl<E: PersistentKV> CommandPipeline<E> {
    pub fn new(store: MVCCStore<E>) -> Self {
        Self {
            store,
            leases: LeaseManager::new(),
            watches: WatchManager::new(),
            dedup: std::collections::HashMap::new(),
            dedup_order: std::collections::VecDeque::new(),
        }
    }

    /// Like `new`, but sizes each watcher's channel per `config.watch_queue_limit`
    /// instead of the built-in default.
    pub fn with_config(store: MVCCStore<E>, config: &Config) -> Self {
        let watches = match config.watch_queue_limit {
            Some(limit) => WatchManager::with_capacity(limit),
            None => WatchManager::new(),
        };
        Self { store, leases: LeaseManager::new(), watches, dedup: std::collections::HashMap::new(), dedup_order: std::collections::VecDeque::new() }
    }

    /// Replaces this pipeline's entire applied state with a snapshot taken
    /// on another node. Any watcher already registered has its start
    /// revision invalidated by the jump, so they're all canceled rather than
    /// left to silently miss whatever the snapshot skipped over.
    pub fn install_snapshot(&mut self, data: crate::snapshot::SnapshotData) -> CResult<()> {
        self.store.install_snapshot(data.current_revision, data.compacted_revision, data.kv_records)?;
        self.leases.install_snapshot(data.leases, data.lease_tick);
        for id in self.watches.ids() {
            self.watches.cancel_with_reason(id, "snapshot installed");
        }
        self.dedup.clear();
        self.dedup_order.clear();
        Ok(())
    }

    fn remember(&mut self, id: RequestId) {
        if self.dedup.insert(id, ()).is_none() {
            self.dedup_order.push_back(id);
            if self.dedup_order.len() > DEDUP_CACHE_CAP {
                if let Some(oldest) = self.dedup_order.pop_front() {
                    self.dedup.remove(&oldest);
                }
            }
        }
    }

    /// Applies one committed entry. Returns `Ok(None)` if `request_id` was
    /// already applied (a retried proposal after a leader change), in which
    /// case the caller should have nothing left to do -- the original
    /// leader's response, if still reachable, is what the client sees.
    ///
    /// An `Err(Error::Internal(_))` here means the state machine hit an
    /// invariant violation; the caller must treat it as fatal and stop
    /// applying rather than risk diverging from the rest of the cluster.
    pub fn apply(&mut self, request_id: RequestId, command: Command) -> CResult<Option<CommandResponse>> {
        if self.dedup.contains_key(&request_id) {
            return Ok(None);
        }

        let response = self.apply_command(command);
        if let Err(err) = &response {
            if !matches!(err, Error::Internal(_)) {
                // Non-fatal application errors (e.g. lease not found) are
                // still a deterministic outcome of this request_id -- remember
                // it so a retry doesn't re-run it and get a different error.
                self.remember(request_id);
            }
            return response.map(Some);
        }

        self.remember(request_id);
        response.map(Some)
    }

    fn apply_command(&mut self, command: Command) -> CResult<CommandResponse> {
        match command {
            Command::Put { key, value, lease } => {
                self.store.begin();
                let event = self.store.put(&key, value, lease)?;
                if lease != 0 {
                    self.leases.attach(lease, key)?;
                }
                self.watches.notify(&event);
                Ok(CommandResponse::Put(event))
            }
            Command::Delete { key } => {
                self.store.begin();
                let event = self.store.delete(&key)?;
                if let Some(event) = &event {
                    self.watches.notify(event);
                    self.leases.detach(event.kv.lease, &key);
                }
                Ok(CommandResponse::Delete(event))
            }
            Command::DeleteRange { start, end } => {
                self.store.begin();
                let events = self.store.delete_range(&start, &end)?;
                for event in &events {
                    self.watches.notify(event);
                    self.leases.detach(event.kv.lease, &event.kv.key);
                }
                Ok(CommandResponse::DeleteRange(events))
            }
            Command::Txn(req) => {
                let result = txn::execute(&mut self.store, &req)?;
                for response in &result.responses {
                    self.notify_from_op_response(response);
                }
                Ok(CommandResponse::Txn(result))
            }
            Command::LeaseGrant { id, ttl_ticks } => Ok(CommandResponse::LeaseGranted(self.leases.grant(id, ttl_ticks)?)),
            Command::LeaseRevoke { id } => {
                let keys = self.leases.revoke(id)?;
                self.store.begin();
                for key in &keys {
                    if let Some(event) = self.store.delete(key)? {
                        self.watches.notify(&event);
                    }
                }
                Ok(CommandResponse::LeaseRevoked(keys))
            }
            Command::LeaseRenew { id } => Ok(CommandResponse::LeaseRenewed { expires_at_tick: self.leases.renew(id)? }),
            Command::Tick { tick } => {
                let expired = self.leases.advance(tick);
                let ids: Vec<i64> = expired.iter().map(|l| l.id).collect();
                if !expired.is_empty() {
                    self.store.begin();
                    for lease in expired {
                        for key in lease.attached_keys {
                            if let Some(event) = self.store.delete(&key)? {
                                self.watches.notify(&event);
                            }
                        }
                    }
                }
                self.watches.notify_progress(self.store.current_revision());
                Ok(CommandResponse::Ticked { expired_leases: ids })
            }
            Command::Compact { at_revision_main } => {
                let reclaimed = self.store.compact(crate::revision::Revision::new(at_revision_main, 0))?;
                Ok(CommandResponse::Compacted { reclaimed })
            }
        }
    }

    /// Registers a watcher, replaying history first when `start_revision` is
    /// non-zero so a caller never has to interleave catch-up and live events
    /// itself -- everything arrives over one channel in revision order. If
    /// `start_revision` has already been compacted away, the watcher is
    /// canceled immediately rather than left registered with no way to ever
    /// catch up: the caller sees `Canceled{reason: "compacted"}` over the
    /// channel instead of an error from this call.
    pub fn register_watch(&mut self, req: WatchRequest) -> CResult<(i64, tokio::sync::mpsc::Receiver<WatchMessage>)> {
        let needs_catchup = !req.start_revision.is_zero();
        let key = req.key.clone();
        let range_end = req.range_end.clone();
        let start_revision = req.start_revision;
        let (id, rx) = self.watches.watch(req);
        if needs_catchup {
            let history = match self.store.history_since(&key, &range_end, start_revision) {
                Ok(history) => history,
                Err(Error::Compacted { .. }) => {
                    self.watches.cancel_with_reason(id, "compacted");
                    return Ok((id, rx));
                }
                Err(err) => return Err(err),
            };
            self.watches.replay(id, history)?;
            self.watches.mark_live(id)?;
        }
        Ok((id, rx))
    }

    fn notify_from_op_response(&mut self, response: &crate::txn::OpResponse) {
        use crate::txn::OpResponse;
        match response {
            OpResponse::Put(event) => self.watches.notify(event),
            OpResponse::Delete(events) => events.iter().for_each(|e| self.watches.notify(e)),
            OpResponse::Get(_) => {}
            OpResponse::Txn(nested) => nested.responses.iter().for_each(|r| self.notify_from_op_response(r)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryEngine;

    fn pipeline() -> CommandPipeline<MemoryEngine> {
        CommandPipeline::new(MVCCStore::new(MemoryEngine::new()))
    }

    fn rid(seq: u64) -> RequestId {
        RequestId { session: 1, seq }
    }

    #[test]
    fn with_config_honors_watch_queue_limit() -> CResult<()> {
        let mut p = CommandPipeline::with_config(MVCCStore::new(MemoryEngine::new()), &Config::default().with_watch_queue_limit(1));
        let (_, mut rx) = p.watches.watch(crate::watch::WatchRequest {
            key: b"a".to_vec(),
            range_end: vec![],
            start_revision: crate::revision::Revision::new(0, 0),
            filter: crate::watch::WatchFilter::default(),
            send_prev_kv: false,
        });
        p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 })?;
        p.apply(rid(2), Command::Put { key: b"a".to_vec(), value: b"2".to_vec(), lease: 0 })?;
        assert!(matches!(rx.try_recv(), Ok(crate::watch::WatchMessage::Event(_))));
        let _ = rx.try_recv();
        Ok(())
    }

    #[test]
    fn put_is_visible_after_apply() -> CResult<()> {
        let mut p = pipeline();
        p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 })?;
        let kv = p.store.get(b"a", crate::revision::ZERO)?.unwrap();
        assert_eq!(kv.value, b"1");
        Ok(())
    }

    #[test]
    fn retried_request_id_is_not_reapplied() -> CResult<()> {
        let mut p = pipeline();
        p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 })?;
        let second = p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"2".to_vec(), lease: 0 })?;
        assert!(second.is_none());
        assert_eq!(p.store.get(b"a", crate::revision::ZERO)?.unwrap().value, b"1");
        Ok(())
    }

    #[test]
    fn lease_revoke_deletes_attached_keys() -> CResult<()> {
        let mut p = pipeline();
        p.apply(rid(1), Command::LeaseGrant { id: 7, ttl_ticks: 100 })?;
        p.apply(rid(2), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 7 })?;
        p.apply(rid(3), Command::LeaseRevoke { id: 7 })?;
        assert!(p.store.get(b"a", crate::revision::ZERO)?.is_none());
        Ok(())
    }

    #[test]
    fn tick_past_ttl_expires_lease_and_deletes_keys() -> CResult<()> {
        let mut p = pipeline();
        p.apply(rid(1), Command::LeaseGrant { id: 7, ttl_ticks: 3 })?;
        p.apply(rid(2), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 7 })?;
        p.apply(rid(3), Command::Tick { tick: 3 })?;
        assert!(p.store.get(b"a", crate::revision::ZERO)?.is_none());
        Ok(())
    }

    #[test]
    fn watch_on_key_sees_put_through_pipeline() -> CResult<()> {
        let mut p = pipeline();
        let (_id, mut rx) = p.watches.watch(crate::watch::WatchRequest {
            key: b"a".to_vec(),
            range_end: vec![],
            start_revision: crate::revision::ZERO,
            filter: crate::watch::WatchFilter::default(),
            send_prev_kv: false,
        });
        p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 })?;
        assert!(rx.try_recv().is_ok());
        Ok(())
    }

    #[test]
    fn register_watch_replays_history_then_delivers_live_events() -> CResult<()> {
        let mut p = pipeline();
        p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 })?;
        p.apply(rid(2), Command::Put { key: b"a".to_vec(), value: b"2".to_vec(), lease: 0 })?;
        let catchup_from = p.store.current_revision();
        p.apply(rid(3), Command::Put { key: b"a".to_vec(), value: b"3".to_vec(), lease: 0 })?;

        let (_id, mut rx) = p.register_watch(crate::watch::WatchRequest {
            key: b"a".to_vec(),
            range_end: vec![],
            start_revision: catchup_from,
            filter: crate::watch::WatchFilter::default(),
            send_prev_kv: false,
        })?;
        p.apply(rid(4), Command::Put { key: b"a".to_vec(), value: b"4".to_vec(), lease: 0 })?;

        let mut values = Vec::new();
        while let Ok(crate::watch::WatchMessage::Event(e)) = rx.try_recv() {
            values.push(e.kv.value);
        }
        assert_eq!(values, vec![b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
        Ok(())
    }

    #[test]
    fn register_watch_below_compacted_watermark_is_canceled_not_errored() -> CResult<()> {
        let mut p = pipeline();
        p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 })?;
        p.apply(rid(2), Command::Put { key: b"a".to_vec(), value: b"2".to_vec(), lease: 0 })?;
        let at = p.store.current_revision().main;
        p.apply(rid(3), Command::Compact { at_revision_main: at })?;

        let (id, mut rx) = p.register_watch(crate::watch::WatchRequest {
            key: b"a".to_vec(),
            range_end: vec![],
            start_revision: crate::revision::Revision::new(1, 0),
            filter: crate::watch::WatchFilter::default(),
            send_prev_kv: false,
        })?;
        assert!(matches!(rx.try_recv().unwrap(), crate::watch::WatchMessage::Canceled(reason) if reason == "compacted"));
        assert_eq!(p.watches.len(), 0);
        let _ = id;
        Ok(())
    }

    #[test]
    fn compact_through_pipeline_reclaims_history() -> CResult<()> {
        let mut p = pipeline();
        p.apply(rid(1), Command::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 })?;
        p.apply(rid(2), Command::Put { key: b"a".to_vec(), value: b"2".to_vec(), lease: 0 })?;
        let at = p.store.current_revision().main;
        p.apply(rid(3), Command::Compact { at_revision_main: at })?;
        assert_eq!(p.store.compacted_revision(), at);
        Ok(())
    }
}
