//! Content identifier handling.
//!
//! The cluster treats CIDs as opaque keys: the only operations are decoding
//! from a string, canonical encoding, and equality. Two CIDs are equal iff
//! their canonical byte encodings are equal.

use crate::error::{Error, Result};
use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Multicodec code for sha2-256.
const SHA2_256: u64 = 0x12;

/// Multicodec code for raw blocks.
const RAW_CODEC: u64 = 0x55;

/// A content identifier naming an immutable content block.
///
/// Thin wrapper around [`cid::Cid`] restricting the surface to what the
/// cluster needs: decode, canonical encode, compare.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinCid(Cid);

impl PinCid {
    /// Decode a CID from its canonical string form.
    pub fn decode(s: &str) -> Result<Self> {
        Cid::try_from(s)
            .map(Self)
            .map_err(|e| Error::NotDecodable {
                cid: s.to_string(),
                reason: e.to_string(),
            })
    }

    /// Decode a CID from its canonical byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Cid::try_from(bytes)
            .map(Self)
            .map_err(|e| Error::NotDecodable {
                cid: format!("{} raw bytes", bytes.len()),
                reason: e.to_string(),
            })
    }

    /// Build a CIDv1 (raw codec, sha2-256) naming the given block of data.
    ///
    /// Used by tooling and tests that need to mint valid CIDs without
    /// talking to a content store.
    pub fn from_raw_data(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        // 32-byte sha2-256 digest always fits the 64-byte multihash table.
        let mh = Multihash::<64>::wrap(SHA2_256, digest.as_slice())
            .unwrap_or_else(|_| unreachable!("sha2-256 digest exceeds multihash capacity"));
        Self(Cid::new_v1(RAW_CODEC, mh))
    }

    /// Canonical byte encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }
}

impl fmt::Display for PinCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for PinCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PinCid({})", self.0)
    }
}

impl FromStr for PinCid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_garbage() {
        let err = PinCid::decode("not-a-cid").unwrap_err();
        assert!(matches!(err, Error::NotDecodable { .. }));
    }

    #[test]
    fn string_round_trip() {
        let cid = PinCid::from_raw_data(b"hello capstan");
        let decoded = PinCid::decode(&cid.to_string()).unwrap();
        assert_eq!(cid, decoded);
    }

    #[test]
    fn byte_round_trip() {
        let cid = PinCid::from_raw_data(b"some block");
        let decoded = PinCid::from_bytes(&cid.to_bytes()).unwrap();
        assert_eq!(cid, decoded);
    }

    #[test]
    fn equality_is_canonical_bytes() {
        let a = PinCid::from_raw_data(b"a");
        let b = PinCid::from_raw_data(b"b");
        assert_ne!(a, b);
        assert_eq!(a.to_bytes(), PinCid::from_raw_data(b"a").to_bytes());
    }

    #[test]
    fn decode_accepts_base58_v0() {
        // A well-known CIDv0 (sha2-256 of an empty unixfs directory).
        let cid = PinCid::decode("QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn").unwrap();
        assert_eq!(
            cid.to_string(),
            "QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn"
        );
    }
}
