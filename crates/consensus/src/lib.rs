//! Consensus-driven shared state for the Capstan cluster.
//!
//! Keeps one replicated, totally ordered log of pin operations across the
//! cluster members and applies committed entries to the local pin state.
//! Built as a Raft-family engine over a pluggable peer transport:
//!
//! - [`OpLog`]: durable append-only operation log (exclusively owned)
//! - [`SnapshotStore`]: bounded on-disk snapshot retention
//! - [`Consensus`]: commit, read, leader discovery, rollback, shutdown
//! - [`MeshNetwork`]: in-process transport for tests and single-process
//!   clusters

pub mod config;
pub mod engine;
pub mod error;
pub mod log;
pub mod op;
pub mod raft;
pub mod snapshots;
pub mod transport;

pub use config::{RaftConfig, RaftSection};
pub use engine::{Consensus, Membership};
pub use error::{ConsensusError, ConsensusResult};
pub use log::{LogEntry, OpLog};
pub use op::{Effect, LogCommand, LogOp, LogOpKind};
pub use raft::{Role, StatusReport};
pub use snapshots::{SnapshotRecord, SnapshotStore, MAX_SNAPSHOTS};
pub use transport::{
    InboundReceiver, InboundRequest, MeshNetwork, MeshTransport, PeerMessage, PeerReply,
    PeerTransport,
};
