//! State error types.

use thiserror::Error;

/// Errors from pin-set state operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// Unpin of a CID that is not in the set. Soft at apply time: the log
    /// is authoritative and repeated unpins must be idempotent on replay.
    #[error("cid is not pinned: {0}")]
    NotPinned(String),

    /// Snapshot bytes do not carry the pin-set tag. The applied value is
    /// not a pin-set state; the applier escalates this to a rollback.
    #[error("snapshot is not a pin-set state: {0}")]
    TypeMismatch(String),

    /// Snapshot encoding or decoding failed.
    #[error("snapshot codec error: {0}")]
    Codec(String),
}

/// Result type alias for state operations.
pub type StateResult<T> = std::result::Result<T, StateError>;
