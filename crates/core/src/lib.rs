//! Core domain types shared across the Capstan cluster crates.
//!
//! This crate defines the canonical data model used by the consensus,
//! state, and agent crates:
//! - Content identifiers and their canonical encoding
//! - Peer identities
//! - The outbound request channel and its message types
//! - The shared error taxonomy for submission-time failures

pub mod cid;
pub mod error;
pub mod peer;
pub mod request;

pub use cid::PinCid;
pub use error::{Error, Result};
pub use peer::PeerId;
pub use request::{request_channel, Request, RequestSender, RPC_MAX_QUEUE};
