//! SQLite Lease Store Implementation
//!
//! Persists leases in a single `leases` table keyed by `(processor, partition_id)`.
//! The processor name namespaces leases so several consumer groups reading the same
//! change feed can share one database file without seeing each other's checkpoints.
//!
//! ## Usage
//!
//! ### File-Based
//! ```ignore
//! let store = SqliteLeaseStore::new("leases.db", "SalesOrderChangeFeed").await?;
//! ```
//!
//! ### In-Memory (Testing)
//! ```ignore
//! let store = SqliteLeaseStore::new_in_memory("SalesOrderChangeFeed").await?;
//! ```
//!
//! ## Conditional Writes
//!
//! - Create: `INSERT .. ON CONFLICT DO NOTHING`, written iff one row was inserted
//! - Update: `UPDATE .. WHERE version = ?`, written iff one row was updated
//!
//! Both are single statements, so SQLite's write lock makes them atomic without an
//! explicit transaction. On a miss the current version is read back for the
//! `Conflict` outcome.

use crate::{
    error::{MetadataError, Result},
    types::*,
    LeaseStore,
};
use async_trait::async_trait;
use feedscale_core::ContinuationToken;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// SQLite-based lease store
pub struct SqliteLeaseStore {
    pool: SqlitePool,
    processor: String,
}

impl SqliteLeaseStore {
    /// Open (or create) the database at `path`.
    pub async fn new<P: AsRef<Path>>(path: P, processor: impl Into<String>) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            processor: processor.into(),
        })
    }

    /// In-memory database (for testing). Each connection to `sqlite::memory:` is its
    /// own database, so the pool is pinned to one connection.
    pub async fn new_in_memory(processor: impl Into<String>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            processor: processor.into(),
        })
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn current_version(&self, partition_id: &str) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT version FROM leases WHERE processor = ? AND partition_id = ?")
            .bind(&self.processor)
            .bind(partition_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(r.try_get::<i64, _>("version")? as u64)),
            None => Ok(None),
        }
    }
}

fn row_to_lease(r: &SqliteRow) -> Result<Lease> {
    let status: String = r.try_get("status")?;
    let checkpoint: Option<String> = r.try_get("checkpoint")?;

    Ok(Lease {
        partition_id: r.try_get("partition_id")?,
        owner: r.try_get("owner")?,
        expires_at: r.try_get("expires_at")?,
        checkpoint: checkpoint.map(ContinuationToken::new),
        version: r.try_get::<i64, _>("version")? as u64,
        generation: r.try_get::<i64, _>("generation")? as u64,
        status: LeaseStatus::from_str(&status)?,
        takeover_by: r.try_get("takeover_by")?,
        updated_at: r.try_get("updated_at")?,
    })
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn get(&self, partition_id: &str) -> Result<Option<Lease>> {
        let row = sqlx::query(
            "SELECT partition_id, owner, expires_at, checkpoint, version, generation, status,
                    takeover_by, updated_at
             FROM leases WHERE processor = ? AND partition_id = ?",
        )
        .bind(&self.processor)
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_lease).transpose()
    }

    async fn conditional_put(&self, mut lease: Lease, expected_version: u64) -> Result<WriteOutcome> {
        let now = Self::now_ms();
        let new_version = expected_version + 1;
        let checkpoint = lease.checkpoint.as_ref().map(|c| c.as_str().to_string());

        let rows_affected = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO leases (processor, partition_id, owner, expires_at, checkpoint,
                                    version, generation, status, takeover_by, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(processor, partition_id) DO NOTHING
                "#,
            )
            .bind(&self.processor)
            .bind(&lease.partition_id)
            .bind(&lease.owner)
            .bind(lease.expires_at)
            .bind(&checkpoint)
            .bind(new_version as i64)
            .bind(lease.generation as i64)
            .bind(lease.status.as_str())
            .bind(&lease.takeover_by)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE leases
                SET owner = ?, expires_at = ?, checkpoint = ?, version = ?,
                    generation = ?, status = ?, takeover_by = ?, updated_at = ?
                WHERE processor = ? AND partition_id = ? AND version = ?
                "#,
            )
            .bind(&lease.owner)
            .bind(lease.expires_at)
            .bind(&checkpoint)
            .bind(new_version as i64)
            .bind(lease.generation as i64)
            .bind(lease.status.as_str())
            .bind(&lease.takeover_by)
            .bind(now)
            .bind(&self.processor)
            .bind(&lease.partition_id)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        match rows_affected {
            1 => {
                lease.version = new_version;
                lease.updated_at = now;
                Ok(WriteOutcome::Written(lease))
            }
            0 => {
                let current_version = self.current_version(&lease.partition_id).await?;
                debug!(
                    processor = %self.processor,
                    partition_id = %lease.partition_id,
                    expected_version,
                    ?current_version,
                    "Conditional lease write lost"
                );
                Ok(WriteOutcome::Conflict { current_version })
            }
            n => Err(MetadataError::InvalidRecord(format!(
                "conditional write on partition {} touched {} rows",
                lease.partition_id, n
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        let rows = sqlx::query(
            "SELECT partition_id, owner, expires_at, checkpoint, version, generation, status,
                    takeover_by, updated_at
             FROM leases WHERE processor = ? ORDER BY partition_id",
        )
        .bind(&self.processor)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_lease).collect()
    }
}
