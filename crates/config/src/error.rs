//! Configuration error types.

use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A remote configuration source was unreachable or answered with a
    /// non-success status.
    #[error("could not fetch configuration from source {url}: {reason}")]
    FetchingSource { url: String, reason: String },

    /// A sourced configuration pointed at another source. Only one level of
    /// redirection is allowed.
    #[error("a sourced configuration cannot point to another source")]
    SourceRedirect,

    /// A component configuration failed validation.
    #[error("{component} failed to validate: {reason}")]
    Validation { component: String, reason: String },

    /// The document has no path to save to.
    #[error("no configuration path set; load from a file or pass a path to save")]
    NoSavePath,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Whether this error happened fetching a remote source (as opposed to
    /// parsing or validating the document).
    pub fn is_fetching_source(&self) -> bool {
        matches!(self, Self::FetchingSource { .. })
    }
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
