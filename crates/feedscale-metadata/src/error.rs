//! Lease Store Error Types
//!
//! Conditional-write conflicts are *not* errors: they come back as
//! `WriteOutcome::Conflict`. Everything here is an infrastructure or data problem.
//!
//! ## Error Categories
//!
//! ### Transient
//! - `Unavailable`: store temporarily unreachable
//! - `DatabaseError` wrapping pool timeouts, I/O and closed pools
//!
//! ### Configuration
//! - `DatabaseError` wrapping bad connection strings, `MigrationError`
//!
//! ### Data
//! - `InvalidRecord`: a stored row that cannot be decoded into a `Lease`

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid lease record: {0}")]
    InvalidRecord(String),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl MetadataError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Unavailable(_) => true,
            MetadataError::DatabaseError(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ) || is_busy(e),
            _ => false,
        }
    }

    /// Whether the store is misconfigured and every call will fail the same way.
    pub fn is_configuration(&self) -> bool {
        match self {
            MetadataError::MigrationError(_) => true,
            MetadataError::DatabaseError(e) => {
                matches!(e, sqlx::Error::Configuration(_) | sqlx::Error::Tls(_))
            }
            _ => false,
        }
    }
}

/// SQLite reports lock contention as a database error with code 5 (BUSY) or 6 (LOCKED).
fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::MigrationError(e.to_string())
    }
}
