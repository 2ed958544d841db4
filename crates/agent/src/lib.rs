//! The Capstan cluster agent.
//!
//! Wires the consensus engine, the pin-set state, and the configuration
//! manager into one controller ([`Cluster`]) that upper layers (REST API,
//! pin tracker, IPFS connector) drive through a small operations surface:
//! pin, unpin, state, leader, the outbound request stream, and shutdown.

pub mod cluster;
pub mod config;
pub mod error;

pub use cluster::Cluster;
pub use config::{ClusterConfig, ClusterSection, PeerEntry};
pub use error::{AgentError, AgentResult};
