//! Failure-injecting state implementations.

use capstan_core::PinCid;
use capstan_state::{MemPinState, PinState, StateError, StateResult};

/// A pin state whose `add` fails once on the nth call, for exercising the
/// rollback path end to end.
pub struct FailingAddState {
    inner: MemPinState,
    calls: usize,
    fail_on_call: usize,
}

impl FailingAddState {
    pub fn new(fail_on_call: usize) -> Self {
        Self {
            inner: MemPinState::new(),
            calls: 0,
            fail_on_call,
        }
    }
}

impl PinState for FailingAddState {
    fn add(&mut self, cid: &PinCid) -> StateResult<()> {
        self.calls += 1;
        if self.calls == self.fail_on_call {
            return Err(StateError::Codec(format!(
                "injected add failure on call {}",
                self.calls
            )));
        }
        self.inner.add(cid)
    }

    fn remove(&mut self, cid: &PinCid) -> StateResult<()> {
        self.inner.remove(cid)
    }

    fn has(&self, cid: &PinCid) -> bool {
        self.inner.has(cid)
    }

    fn list(&self) -> Vec<PinCid> {
        self.inner.list()
    }

    fn version(&self) -> u64 {
        self.inner.version()
    }

    fn set_version(&mut self, version: u64) {
        self.inner.set_version(version)
    }

    fn snapshot(&self) -> StateResult<Vec<u8>> {
        self.inner.snapshot()
    }

    fn restore(&mut self, bytes: &[u8]) -> StateResult<()> {
        self.inner.restore(bytes)
    }
}
