//! Change Feed Trait
//!
//! `ChangeFeed` abstracts over the monitored log. Implementations must be `Send + Sync`
//! so one instance can be shared via `Arc<dyn ChangeFeed>` between the registry, every
//! feed consumer and the lag estimator.
//!
//! The trait is read-only: feedscale never writes to the log.

use crate::error::{FeedError, Result};
use crate::record::{Batch, ContinuationToken, Partition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Current partition set, ordered by partition id.
    async fn list_partitions(&self) -> Result<Vec<Partition>>;

    /// Read up to `max_items` records starting at `from`.
    ///
    /// `from = None` reads from the beginning of the partition. The returned
    /// batch's `continuation` is where the next read should start.
    ///
    /// # Errors
    ///
    /// - `PartitionNotFound`: partition retired by the log
    /// - `InvalidToken`: `from` was not produced by this log
    /// - `Unavailable`: transient failure
    async fn read_from(
        &self,
        partition_id: &str,
        from: Option<&ContinuationToken>,
        max_items: usize,
    ) -> Result<Batch>;

    /// Position right after the newest record of the partition.
    async fn head_position(&self, partition_id: &str) -> Result<ContinuationToken>;

    /// Number of records between `from` (or the beginning) and `head`.
    ///
    /// This is the log's own distance function. It may be approximate but is
    /// never negative: a `from` ahead of `head` yields zero.
    fn distance(&self, from: Option<&ContinuationToken>, head: &ContinuationToken) -> Result<u64>;
}

/// Where a partition without a checkpoint starts being consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Process everything the partition already holds
    #[default]
    Beginning,
    /// Skip existing records and start at the head observed on first read
    Now,
}

impl fmt::Display for StartFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartFrom::Beginning => write!(f, "beginning"),
            StartFrom::Now => write!(f, "now"),
        }
    }
}

impl FromStr for StartFrom {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginning" | "earliest" => Ok(StartFrom::Beginning),
            "now" | "latest" => Ok(StartFrom::Now),
            other => Err(FeedError::Misconfigured(format!(
                "unknown start position '{}', expected 'beginning' or 'now'",
                other
            ))),
        }
    }
}
