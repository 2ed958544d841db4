//! Pin-set state for the Capstan cluster.
//!
//! The authoritative set of cluster-pinned CIDs, fed only by the replicated
//! log applier. Implementations plug in by name through the configuration's
//! `state` section; this crate ships the in-memory one.

pub mod config;
pub mod error;
pub mod pin_set;
pub mod snapshot;

pub use config::{StateBackendConfig, StateSection};
pub use error::{StateError, StateResult};
pub use pin_set::{MemPinState, PinState, StateView};
pub use snapshot::Snapshot;

/// Create a pin-set state from its configuration section.
pub fn from_config(config: &StateBackendConfig) -> Box<dyn PinState> {
    match config {
        StateBackendConfig::Memory => Box::new(MemPinState::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_builds_memory_state() {
        let state = from_config(&StateBackendConfig::default());
        assert_eq!(state.version(), 0);
        assert!(state.list().is_empty());
    }
}
