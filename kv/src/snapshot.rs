//! A point-in-time dump of the MVCC state, installed on a lagging follower
//! instead of replaying its entire log. Binary layout:
//!
//! ```text
//! magic (4B) | format version (u32 BE) | bincode(SnapshotBody) | crc32 (u32 BE)
//! ```
//!
//! `SnapshotEngine` only frames and checksums; `raft::node` decides when a
//! follower needs one and streams it over `raft::transport::Transport` in
//! `MAX_CHUNK_SIZE` pieces so a multi-gigabyte dataset never needs to be
//! buffered whole on the wire.

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::lease::Lease;
use crate::raft::log::Index;
use crate::raft::Term;
use crate::revision::Revision;
use crate::types::KeyValue;

const MAGIC: [u8; 4] = *b"KVS1";
/// Bumped to 2 when `Lease` gained its `expired` field -- bincode encodes a
/// struct as a fixed sequence of fields with no tag for "field absent", so a
/// body shape change needs a version bump here rather than relying on
/// `#[serde(default)]` (which only helps self-describing formats). `decode`
/// rejects anything that doesn't match the version it was built against.
const FORMAT_VERSION: u32 = 2;

/// Upper bound on a single chunk handed to the transport layer.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotBody {
    current_revision: Revision,
    compacted_revision: i64,
    leases: Vec<Lease>,
    lease_tick: i64,
    kv_records: Vec<(Revision, KeyValue)>,
    last_included_index: Index,
    last_included_term: Term,
}

/// What a caller hands in to build a snapshot and gets back after restoring
/// one. `last_included_index`/`last_included_term` tie the MVCC state to a
/// point in the Raft log, so installing a snapshot can fast-forward the log
/// to the same point instead of leaving it out of sync with the state
/// machine it now describes.
#[derive(Debug)]
pub struct SnapshotData {
    pub current_revision: Revision,
    pub compacted_revision: i64,
    pub leases: Vec<Lease>,
    /// `LeaseManager::current_tick` at the moment the snapshot was taken.
    pub lease_tick: i64,
    pub kv_records: Vec<(Revision, KeyValue)>,
    pub last_included_index: Index,
    pub last_included_term: Term,
}

/// Serializes `data` into a framed, checksummed byte stream.
pub fn encode(data: SnapshotData) -> CResult<Vec<u8>> {
    let body = SnapshotBody {
        current_revision: data.current_revision,
        compacted_revision: data.compacted_revision,
        leases: data.leases,
        lease_tick: data.lease_tick,
        kv_records: data.kv_records,
        last_included_index: data.last_included_index,
        last_included_term: data.last_included_term,
    };
    let payload = bincode::serialize(&body)?;
    log::info!("encoding snapshot at revision {} with {} records", body.current_revision.main, body.kv_records.len());

    let mut out = Vec::with_capacity(4 + 4 + payload.len() + 4);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    Ok(out)
}

/// Verifies the magic, version, and checksum, then deserializes the body.
pub fn decode(bytes: &[u8]) -> CResult<SnapshotData> {
    if bytes.len() < 4 + 4 + 4 {
        return Err(Error::InputInvalid("snapshot too short to contain a header and checksum".into()));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::InputInvalid("snapshot magic mismatch".into()));
    }
    let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::InputInvalid(format!("unsupported snapshot format version {version}")));
    }

    let payload = &bytes[8..bytes.len() - 4];
    let want_crc = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    let got_crc = crc32fast::hash(payload);
    if got_crc != want_crc {
        return Err(Error::Internal(format!("snapshot checksum mismatch: expected {want_crc}, got {got_crc}")));
    }

    let body: SnapshotBody = bincode::deserialize(payload)?;
    Ok(SnapshotData {
        current_revision: body.current_revision,
        compacted_revision: body.compacted_revision,
        leases: body.leases,
        lease_tick: body.lease_tick,
        kv_records: body.kv_records,
        last_included_index: body.last_included_index,
        last_included_term: body.last_included_term,
    })
}

/// Splits an encoded snapshot into `<= MAX_CHUNK_SIZE`-byte pieces, in
/// order. `reassemble` is the inverse.
pub fn chunk(bytes: &[u8]) -> Vec<&[u8]> {
    bytes.chunks(MAX_CHUNK_SIZE).collect()
}

pub fn reassemble(chunks: &[Vec<u8>]) -> Vec<u8> {
    chunks.iter().flat_map(|c| c.iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotData {
        SnapshotData {
            current_revision: Revision::new(10, 0),
            compacted_revision: 3,
            leases: vec![Lease { id: 1, ttl_ticks: 60, expires_at_tick: 70, attached_keys: Default::default(), expired: false }],
            lease_tick: 9,
            kv_records: vec![(
                Revision::new(5, 0),
                KeyValue { key: b"a".to_vec(), value: b"1".to_vec(), create_revision: 5, mod_revision: 5, version: 1, lease: 0 },
            )],
            last_included_index: 12,
            last_included_term: 2,
        }
    }

    #[test]
    fn encode_decode_round_trips() -> CResult<()> {
        let bytes = encode(sample())?;
        let decoded = decode(&bytes)?;
        assert_eq!(decoded.current_revision, Revision::new(10, 0));
        assert_eq!(decoded.compacted_revision, 3);
        assert_eq!(decoded.leases.len(), 1);
        assert_eq!(decoded.kv_records.len(), 1);
        assert_eq!(decoded.last_included_index, 12);
        assert_eq!(decoded.last_included_term, 2);
        Ok(())
    }

    #[test]
    fn corrupted_payload_fails_checksum() -> CResult<()> {
        let mut bytes = encode(sample())?;
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        Ok(())
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = encode(sample()).unwrap();
        bytes[0] = b'X';
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn mismatched_format_version_is_rejected() {
        let mut bytes = encode(sample()).unwrap();
        bytes[4..8].copy_from_slice(&1u32.to_be_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));
    }

    #[test]
    fn chunking_and_reassembly_round_trips_large_payloads() -> CResult<()> {
        let mut data = sample();
        for i in 0..2000 {
            data.kv_records.push((
                Revision::new(100 + i, 0),
                KeyValue { key: format!("k{i}").into_bytes(), value: vec![0u8; 4096], create_revision: 1, mod_revision: 1, version: 1, lease: 0 },
            ));
        }
        let bytes = encode(data)?;
        let chunks: Vec<Vec<u8>> = chunk(&bytes).into_iter().map(|c| c.to_vec()).collect();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= MAX_CHUNK_SIZE));

        let reassembled = reassemble(&chunks);
        let decoded = decode(&reassembled)?;
        assert_eq!(decoded.kv_records.len(), 2001);
        Ok(())
    }
}
