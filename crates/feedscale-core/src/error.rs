//! Error Types for the Change Feed
//!
//! ## Error Categories
//!
//! ### Transient
//! - `Unavailable`: the log could not be reached or timed out; callers retry with backoff
//!
//! ### Partition Lifecycle
//! - `PartitionNotFound`: the partition was retired by the log (split/merge)
//!
//! ### Data Errors
//! - `InvalidToken`: a continuation token the log cannot interpret
//!
//! ### Configuration
//! - `Misconfigured`: unreachable endpoint, missing credential, bad container name. These fail
//!   identically on every call and are never retried.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Change feed unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid continuation token: {0}")]
    InvalidToken(String),

    #[error("Change feed misconfigured: {0}")]
    Misconfigured(String),
}

impl FeedError {
    /// Whether the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Unavailable(_))
    }

    /// Whether the error will repeat on every call until an operator intervenes.
    pub fn is_configuration(&self) -> bool {
        matches!(self, FeedError::Misconfigured(_))
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
