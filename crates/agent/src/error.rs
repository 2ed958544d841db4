//! Agent error types.

use thiserror::Error;

/// Errors surfaced by the cluster agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("consensus error: {0}")]
    Consensus(#[from] capstan_consensus::ConsensusError),

    #[error("config error: {0}")]
    Config(#[from] capstan_config::ConfigError),

    #[error("state error: {0}")]
    State(#[from] capstan_state::StateError),

    #[error("core error: {0}")]
    Core(#[from] capstan_core::Error),
}

/// Result type alias for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
