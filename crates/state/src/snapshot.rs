//! The deterministic snapshot codec.
//!
//! A snapshot is the serialized pin set at a given log index. Encoding is
//! deterministic: the same set and index always produce the same bytes, so
//! peers can compare snapshots byte-for-byte during rollback validation.
//! The payload carries a magic tag; restoring from bytes that are not a
//! pin-set snapshot fails with an explicit type mismatch instead of
//! producing garbage state.

use crate::error::{StateError, StateResult};
use capstan_core::PinCid;
use serde::{Deserialize, Serialize};

/// Tag identifying pin-set snapshots.
const SNAPSHOT_MAGIC: &[u8; 12] = b"capstan-pins";

/// Bumped when the snapshot layout changes.
const SNAPSHOT_CODEC_VERSION: u16 = 1;

/// A serialized pin set plus the log index it was taken at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    magic: [u8; 12],
    codec: u16,
    /// Index of the last log entry reflected in this snapshot.
    pub index: u64,
    /// Canonical CID encodings, sorted.
    pub cids: Vec<Vec<u8>>,
}

impl Snapshot {
    /// Build a snapshot from sorted canonical CID bytes.
    pub fn new(index: u64, cids: Vec<Vec<u8>>) -> Self {
        Self {
            magic: *SNAPSHOT_MAGIC,
            codec: SNAPSHOT_CODEC_VERSION,
            index,
            cids,
        }
    }

    /// Deterministic byte encoding.
    pub fn encode(&self) -> StateResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StateError::Codec(e.to_string()))
    }

    /// Decode and verify the pin-set tag.
    pub fn decode(bytes: &[u8]) -> StateResult<Self> {
        let snapshot: Snapshot =
            bincode::deserialize(bytes).map_err(|e| StateError::TypeMismatch(e.to_string()))?;
        if snapshot.magic != *SNAPSHOT_MAGIC {
            return Err(StateError::TypeMismatch(
                "unrecognized snapshot magic".to_string(),
            ));
        }
        if snapshot.codec != SNAPSHOT_CODEC_VERSION {
            return Err(StateError::TypeMismatch(format!(
                "unsupported snapshot codec version {}",
                snapshot.codec
            )));
        }
        Ok(snapshot)
    }

    /// Parse the stored byte encodings back into CIDs.
    pub fn pins(&self) -> StateResult<Vec<PinCid>> {
        self.cids
            .iter()
            .map(|bytes| {
                PinCid::from_bytes(bytes).map_err(|e| StateError::Codec(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_deterministic() {
        let mut cids: Vec<Vec<u8>> = vec![
            PinCid::from_raw_data(b"b").to_bytes(),
            PinCid::from_raw_data(b"a").to_bytes(),
        ];
        cids.sort();
        let a = Snapshot::new(7, cids.clone()).encode().unwrap();
        let b = Snapshot::new(7, cids).encode().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decode_round_trip() {
        let cid = PinCid::from_raw_data(b"block");
        let snapshot = Snapshot::new(3, vec![cid.to_bytes()]);
        let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded.index, 3);
        assert_eq!(decoded.pins().unwrap(), vec![cid]);
    }

    #[test]
    fn decode_rejects_foreign_bytes() {
        let err = Snapshot::decode(b"not a snapshot at all").unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch(_)));
    }

    #[test]
    fn decode_rejects_wrong_magic() {
        let mut snapshot = Snapshot::new(1, vec![]);
        snapshot.magic = *b"foreign-tag!";
        let bytes = bincode::serialize(&snapshot).unwrap();
        let err = Snapshot::decode(&bytes).unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch(_)));
    }
}
