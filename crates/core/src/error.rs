//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A CID string could not be parsed into a content identifier.
    #[error("cannot decode cid {cid:?}: {reason}")]
    NotDecodable { cid: String, reason: String },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
