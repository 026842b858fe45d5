//! The etcd-style `Txn`: a list of comparisons evaluated against the
//! current revision, followed by one of two operation lists depending on
//! whether every comparison held. No snapshot isolation across the
//! transaction itself -- it runs entirely within one applied batch, so
//! there is nothing concurrent with it to isolate from.

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::mvcc::store::MVCCStore;
use crate::storage::engine::PersistentKV;
use crate::types::{KeyValue, WatchEvent};

/// Recursion cap on nested `Txn` operations. Generous for any real request,
/// and cheap insurance against a pathological or malicious request tree.
const MAX_TXN_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    Value,
    Version,
    CreateRevision,
    ModRevision,
    Lease,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    Greater,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareValue {
    Bytes(Vec<u8>),
    Int(i64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Compare {
    pub key: Vec<u8>,
    pub target: CompareTarget,
    pub op: CompareOp,
    pub value: CompareValue,
}

impl Compare {
    /// Evaluates against `kv`, or `None` if the key doesn't currently exist
    /// -- a missing key only satisfies a `NotEqual`/`Less` comparison
    /// against a non-absent value, matching etcd's "absent key" semantics.
    fn holds(&self, kv: Option<&KeyValue>) -> bool {
        let ord = match (kv, &self.value) {
            (None, _) => return matches!(self.op, CompareOp::NotEqual | CompareOp::Less),
            (Some(kv), CompareValue::Bytes(want)) if self.target == CompareTarget::Value => kv.value.cmp(want),
            (Some(kv), CompareValue::Int(want)) => match self.target {
                CompareTarget::Version => kv.version.cmp(want),
                CompareTarget::CreateRevision => kv.create_revision.cmp(want),
                CompareTarget::ModRevision => kv.mod_revision.cmp(want),
                CompareTarget::Lease => kv.lease.cmp(want),
                CompareTarget::Value => return false, // type mismatch: never holds
            },
            _ => return false, // type mismatch: never holds
        };
        match self.op {
            CompareOp::Equal => ord.is_eq(),
            CompareOp::NotEqual => ord.is_ne(),
            CompareOp::Less => ord.is_lt(),
            CompareOp::Greater => ord.is_gt(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64 },
    Get { key: Vec<u8>, range_end: Vec<u8> },
    Delete { key: Vec<u8>, range_end: Vec<u8> },
    Txn(Box<TxnRequest>),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxnRequest {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

#[derive(Debug)]
pub enum OpResponse {
    Put(WatchEvent),
    Get(Vec<KeyValue>),
    Delete(Vec<WatchEvent>),
    Txn(TxnResult),
}

#[derive(Debug)]
pub struct TxnResult {
    pub succeeded: bool,
    pub responses: Vec<OpResponse>,
}

/// Runs `req` against `store`. Opens exactly one commit batch on `store` up
/// front (via `begin`), so every mutating op inside -- including nested
/// `Txn`s -- shares the same `main` revision and advances only `sub`.
pub fn execute<E: PersistentKV>(store: &mut MVCCStore<E>, req: &TxnRequest) -> CResult<TxnResult> {
    store.begin();
    execute_at_depth(store, req, 0)
}

fn execute_at_depth<E: PersistentKV>(store: &mut MVCCStore<E>, req: &TxnRequest, depth: usize) -> CResult<TxnResult> {
    if depth >= MAX_TXN_DEPTH {
        return Err(Error::InputInvalid(format!("transaction nesting exceeds {MAX_TXN_DEPTH}")));
    }

    let mut succeeded = true;
    for cmp in &req.compares {
        let kv = store.get(&cmp.key, crate::revision::ZERO)?;
        if !cmp.holds(kv.as_ref()) {
            succeeded = false;
            break;
        }
    }

    let branch = if succeeded { &req.success } else { &req.failure };
    let mut responses = Vec::with_capacity(branch.len());
    for op in branch {
        responses.push(execute_op(store, op, depth)?);
    }

    Ok(TxnResult { succeeded, responses })
}

fn execute_op<E: PersistentKV>(store: &mut MVCCStore<E>, op: &Op, depth: usize) -> CResult<OpResponse> {
    match op {
        Op::Put { key, value, lease } => Ok(OpResponse::Put(store.put(key, value.clone(), *lease)?)),
        Op::Get { key, range_end } => {
            if range_end.is_empty() {
                Ok(OpResponse::Get(store.get(key, crate::revision::ZERO)?.into_iter().collect()))
            } else {
                Ok(OpResponse::Get(store.range(key, range_end, crate::revision::ZERO, 0)?))
            }
        }
        Op::Delete { key, range_end } => {
            if range_end.is_empty() {
                Ok(OpResponse::Delete(store.delete(key)?.into_iter().collect()))
            } else {
                Ok(OpResponse::Delete(store.delete_range(key, range_end)?))
            }
        }
        Op::Txn(nested) => Ok(OpResponse::Txn(execute_at_depth(store, nested, depth + 1)?)),
    }
}
