//! Consensus error types.

use capstan_state::StateError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the consensus engine.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// No leader is known at submission time. Retrying with backoff is safe.
    #[error("no cluster leader known")]
    NoLeader,

    /// The submission context ended before the operation committed. The
    /// outcome is unknown; callers should consult the state.
    #[error("timed out waiting for commit")]
    CommitTimeout,

    /// An apply failed on this entry and a cluster-wide restore was issued.
    #[error("a rollback was requested. Reason: {0}")]
    RollbackRequested(String),

    /// The engine is shutting down; pending submissions are aborted.
    #[error("consensus is shutting down")]
    ShuttingDown,

    /// The operation log directory is already held by another instance.
    #[error("operation log at {0} is locked by another process")]
    LogLocked(PathBuf),

    /// A log record or command failed to encode or decode.
    #[error("log codec error: {0}")]
    Codec(String),

    /// A peer call failed or timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// Taking a snapshot failed for a reason other than having nothing new
    /// to snapshot. Logged at shutdown; shutdown continues.
    #[error("snapshot failure: {0}")]
    SnapshotFailure(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Cid(#[from] capstan_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for consensus operations.
pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;
