//! feedscale Lease Store
//!
//! This crate holds the only durable state in feedscale: one lease record per change-feed
//! partition, carrying who consumes it, until when, and how far they got.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   acquire / renew / checkpoint   ┌─────────────┐
//! │   Agents     │ ───────────── conditional_put ──▶ │             │
//! └──────────────┘                                   │ Lease Store │ ◄── You are here
//! ┌──────────────┐                                   │ (SQLite /   │
//! │ Lag estimator│ ◄──────────── list / get ──────── │  memory)    │
//! └──────────────┘                                   └─────────────┘
//! ```
//!
//! There is no lock service. Every mutation is a compare-and-swap on the lease version,
//! so two instances racing for a partition cannot both win.
//!
//! ## Usage Example
//!
//! ```ignore
//! use feedscale_metadata::{Lease, LeaseStore, SqliteLeaseStore, WriteOutcome};
//!
//! let store = SqliteLeaseStore::new("leases.db", "SalesOrderChangeFeed").await?;
//!
//! // Create a lease for a new partition (expected version 0 = must not exist)
//! store.conditional_put(Lease::new("0"), 0).await?;
//!
//! // Claim it
//! let lease = store.get("0").await?.unwrap();
//! match store.conditional_put(lease.claimed_by("Instance-a", expires_at), lease.version).await? {
//!     WriteOutcome::Written(lease) => println!("owned at version {}", lease.version),
//!     WriteOutcome::Conflict { .. } => println!("somebody else got there first"),
//! }
//! ```

pub mod clock;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{MetadataError, Result};
pub use memory::MemoryLeaseStore;
pub use store::SqliteLeaseStore;
pub use types::*;

use async_trait::async_trait;

/// Lease store trait - abstracts over storage backends.
///
/// ## Thread Safety
///
/// All implementations must be Send + Sync, allowing safe sharing across async tasks
/// via `Arc<dyn LeaseStore>`.
///
/// ## Consistency
///
/// `conditional_put` must be atomic with respect to other `conditional_put` calls on
/// the same partition. Reads may be slightly stale; the lag estimator tolerates that.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Fetch the lease for a partition.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(Lease))` if a lease exists (active or retired)
    /// - `Ok(None)` if the partition has never been seen
    async fn get(&self, partition_id: &str) -> Result<Option<Lease>>;

    /// Write `lease` if the stored version equals `expected_version`.
    ///
    /// `expected_version == 0` creates the lease and only succeeds if none exists.
    /// The `version` field of the passed lease is ignored; the stored lease gets
    /// `expected_version + 1`.
    ///
    /// # Returns
    ///
    /// - `WriteOutcome::Written(lease)` with the stored lease
    /// - `WriteOutcome::Conflict { current_version }` when another writer got there first
    async fn conditional_put(&self, lease: Lease, expected_version: u64) -> Result<WriteOutcome>;

    /// All leases, sorted by partition id.
    async fn list(&self) -> Result<Vec<Lease>>;
}
