//! The pin-set capability and its in-memory implementation.

use crate::error::{StateError, StateResult};
use crate::snapshot::Snapshot;
use capstan_core::PinCid;
use std::collections::BTreeSet;

/// The set of cluster-pinned CIDs at a given log index.
///
/// Mutated only by the replicated log applier on the local peer; everyone
/// else reads through shallow [`StateView`]s or serialized snapshots.
/// Implementations plug in by name via the configuration's `state` section.
pub trait PinState: Send + Sync {
    /// Record a CID as pinned. Idempotent: adding a CID that is already
    /// present succeeds without change.
    fn add(&mut self, cid: &PinCid) -> StateResult<()>;

    /// Remove a CID from the set. Fails with [`StateError::NotPinned`] when
    /// the CID is absent.
    fn remove(&mut self, cid: &PinCid) -> StateResult<()>;

    /// Whether the CID is in the set.
    fn has(&self, cid: &PinCid) -> bool;

    /// The pinned CIDs. Order is stable between calls if no mutation
    /// happened in between.
    fn list(&self) -> Vec<PinCid>;

    /// Index of the last applied log entry.
    fn version(&self) -> u64;

    /// Advance the logical version. Set by the applier after each entry.
    fn set_version(&mut self, version: u64);

    /// Deterministic serialization of the current set and version: the same
    /// logical state always produces the same bytes.
    fn snapshot(&self) -> StateResult<Vec<u8>>;

    /// Replace the whole state with the one in `bytes`. A state restored
    /// from a snapshot taken at index *n* is indistinguishable from one
    /// produced by replaying entries 1..n.
    fn restore(&mut self, bytes: &[u8]) -> StateResult<()>;
}

/// A read-only view of the state at some version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateView {
    pub pins: Vec<PinCid>,
    pub version: u64,
}

impl StateView {
    pub fn has(&self, cid: &PinCid) -> bool {
        self.pins.contains(cid)
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

/// In-memory pin set over a sorted set of CIDs.
///
/// Sorted storage keeps `list()` and snapshots deterministic without extra
/// work.
#[derive(Debug, Default)]
pub struct MemPinState {
    pins: BTreeSet<PinCid>,
    version: u64,
}

impl MemPinState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state as a read-only view.
    pub fn view(&self) -> StateView {
        StateView {
            pins: self.list(),
            version: self.version,
        }
    }
}

impl PinState for MemPinState {
    fn add(&mut self, cid: &PinCid) -> StateResult<()> {
        self.pins.insert(*cid);
        Ok(())
    }

    fn remove(&mut self, cid: &PinCid) -> StateResult<()> {
        if !self.pins.remove(cid) {
            return Err(StateError::NotPinned(cid.to_string()));
        }
        Ok(())
    }

    fn has(&self, cid: &PinCid) -> bool {
        self.pins.contains(cid)
    }

    fn list(&self) -> Vec<PinCid> {
        self.pins.iter().copied().collect()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn snapshot(&self) -> StateResult<Vec<u8>> {
        let cids = self.pins.iter().map(PinCid::to_bytes).collect();
        Snapshot::new(self.version, cids).encode()
    }

    fn restore(&mut self, bytes: &[u8]) -> StateResult<()> {
        let snapshot = Snapshot::decode(bytes)?;
        let pins = snapshot.pins()?;
        self.pins = pins.into_iter().collect();
        self.version = snapshot.index;
        Ok(())
    }
}
