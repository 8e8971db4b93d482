//! Error types for feedscale agents

use feedscale_core::FeedError;
use feedscale_metadata::MetadataError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent already started")]
    AlreadyStarted,

    #[error("Lease store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Metadata(e) => e.is_transient(),
            AgentError::Feed(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Errors that will not go away by retrying and should stop the agent.
    pub fn is_configuration(&self) -> bool {
        match self {
            AgentError::Config(_) => true,
            AgentError::Metadata(e) => e.is_configuration(),
            AgentError::Feed(e) => e.is_configuration(),
            _ => false,
        }
    }
}
