//! Error types for the scaler

use feedscale_agent::AgentError;
use feedscale_core::FeedError;
use feedscale_metadata::MetadataError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScalerError>;

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("Lease store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Partition discovery failed: {0}")]
    Agent(#[from] AgentError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

impl ScalerError {
    pub fn is_transient(&self) -> bool {
        match self {
            ScalerError::Metadata(e) => e.is_transient(),
            ScalerError::Feed(e) => e.is_transient(),
            ScalerError::Agent(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Errors every later poll would hit again.
    pub fn is_configuration(&self) -> bool {
        match self {
            ScalerError::Config(_) => true,
            ScalerError::Metadata(e) => e.is_configuration(),
            ScalerError::Feed(e) => e.is_configuration(),
            ScalerError::Agent(e) => e.is_configuration(),
            ScalerError::Server(_) => false,
        }
    }
}
