//! Lease grants, renewals, key attachment, and expiry.
//!
//! TTLs are measured in committed ticks, not wall-clock time: one tick per
//! Raft entry the leader commits carrying a `Tick` command (see
//! `pipeline::Command::Tick`), so every replica reaches the same expiry
//! decision from the same input regardless of clock skew between nodes.
//! Modeled on Xline's `LeaseCollection`/`LeaseQueue` split: a map for O(1)
//! lookup by id, and an ordered queue for O(log n) "what expires next".

use std::collections::{BTreeSet, HashMap, HashSet};

use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: i64,
    pub ttl_ticks: i64,
    pub expires_at_tick: i64,
    pub attached_keys: HashSet<Vec<u8>>,
    /// Set by `advance` once the lease's TTL has elapsed. A lease lingers in
    /// `LeaseManager::leases` in this state until explicitly revoked, rather
    /// than being removed the moment it expires -- that's what lets `renew`
    /// tell an expired lease (`Error::Expired`) apart from one that was
    /// never granted or was already revoked (`Error::NotFound`).
    #[serde(default)]
    pub expired: bool,
}

#[derive(Default)]
pub struct LeaseManager {
    leases: HashMap<i64, Lease>,
    /// `(expires_at_tick, id)` pairs, so the next expiry is always the
    /// minimum element. A lease's old entry is left in place on renewal and
    /// filtered out on pop by comparing against the live `expires_at_tick`.
    queue: BTreeSet<(i64, i64)>,
    current_tick: i64,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tick(&self) -> i64 {
        self.current_tick
    }

    /// Every lease currently held, for building a snapshot.
    pub fn all(&self) -> Vec<Lease> {
        self.leases.values().cloned().collect()
    }

    /// Replaces all lease state with a snapshot taken elsewhere.
    pub fn install_snapshot(&mut self, leases: Vec<Lease>, current_tick: i64) {
        self.leases.clear();
        self.queue.clear();
        self.current_tick = current_tick;
        for lease in leases {
            self.queue.insert((lease.expires_at_tick, lease.id));
            self.leases.insert(lease.id, lease);
        }
    }

    /// Grants a lease. `id == 0` mints a random positive id; otherwise the
    /// caller-supplied id is used verbatim (the replicated path: the leader
    /// picks the id before proposing, so every replica grants the same one).
    pub fn grant(&mut self, id: i64, ttl_ticks: i64) -> CResult<Lease> {
        let id = if id != 0 { id } else { self.mint_id() };
        if self.leases.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("lease {id}")));
        }
        let expires_at_tick = self.current_tick + ttl_ticks;
        let lease = Lease { id, ttl_ticks, expires_at_tick, attached_keys: HashSet::new(), expired: false };
        self.queue.insert((expires_at_tick, id));
        self.leases.insert(id, lease.clone());
        Ok(lease)
    }

    fn mint_id(&self) -> i64 {
        loop {
            let candidate = rand::thread_rng().gen_range(1..=i64::MAX);
            if !self.leases.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Resets a lease's countdown to a full TTL from now. Returns the new
    /// `expires_at_tick`. A lease that has already ticked past its TTL stays
    /// in the manager flagged `expired` rather than being evicted, so this
    /// can tell that case (`Error::Expired`) apart from a lease that was
    /// never granted or was already revoked (`Error::NotFound`).
    pub fn renew(&mut self, id: i64) -> CResult<i64> {
        let lease = self.leases.get_mut(&id).ok_or_else(|| Error::NotFound(format!("lease {id}")))?;
        if lease.expired || lease.expires_at_tick <= self.current_tick {
            lease.expired = true;
            return Err(Error::Expired(format!("lease {id}")));
        }
        let new_expiry = self.current_tick + lease.ttl_ticks;
        lease.expires_at_tick = new_expiry;
        self.queue.insert((new_expiry, id));
        Ok(new_expiry)
    }

    /// Revokes a lease immediately, returning the keys that were attached to
    /// it so the caller can delete them from the MVCC store. Works
    /// regardless of whether the lease has already expired.
    pub fn revoke(&mut self, id: i64) -> CResult<Vec<Vec<u8>>> {
        let lease = self.leases.remove(&id).ok_or_else(|| Error::NotFound(format!("lease {id}")))?;
        Ok(lease.attached_keys.into_iter().collect())
    }

    pub fn attach(&mut self, id: i64, key: Vec<u8>) -> CResult<()> {
        let lease = self.leases.get_mut(&id).ok_or_else(|| Error::NotFound(format!("lease {id}")))?;
        lease.attached_keys.insert(key);
        Ok(())
    }

    pub fn detach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.attached_keys.remove(key);
        }
    }

    /// An expired-but-not-yet-revoked lease reads as `NotFound`, same as one
    /// that was never granted -- its keys are already gone from the MVCC
    /// store by the time it's flagged, so there's nothing left a caller
    /// should be able to read off of it.
    pub fn get(&self, id: i64) -> CResult<&Lease> {
        match self.leases.get(&id) {
            Some(lease) if !lease.expired => Ok(lease),
            _ => Err(Error::NotFound(format!("lease {id}"))),
        }
    }

    pub fn time_to_live(&self, id: i64) -> CResult<i64> {
        let lease = self.get(id)?;
        Ok((lease.expires_at_tick - self.current_tick).max(0))
    }

    /// Advances the committed-tick clock to `tick` and returns every lease
    /// (with its attached keys) that has now expired. Expired leases are
    /// flagged rather than removed from the manager, so `revoke` can still
    /// clean up a lease's attached keys after the fact and `get`/`renew`
    /// have a way to tell "expired" apart from "never existed". The caller
    /// is responsible for deleting the returned keys from the MVCC store in
    /// the same applied batch.
    pub fn advance(&mut self, tick: i64) -> Vec<Lease> {
        self.current_tick = tick;
        let mut expired = Vec::new();
        while let Some(&(expires_at, id)) = self.queue.iter().next() {
            if expires_at > self.current_tick {
                break;
            }
            self.queue.remove(&(expires_at, id));
            // A renewal reinserts a fresh entry but leaves the stale one in
            // the queue; only act on it if it still matches the live lease.
            if let Some(lease) = self.leases.get_mut(&id) {
                if lease.expires_at_tick == expires_at && !lease.expired {
                    lease.expired = true;
                    expired.push(lease.clone());
                }
            }
        }
        expired
    }
}
