//! feedscale Core - Change Feed Contract
//!
//! The monitored change feed is an external, append-only, partitioned log. This crate
//! defines the narrow surface feedscale needs from it:
//!
//! - **Partitions**: independently ordered shards, discovered via `list_partitions()`
//! - **Batches**: ordered runs of records read from a continuation token
//! - **Head positions**: where each partition currently ends
//! - **Distance**: the log's own measure of how far a token is behind the head
//!
//! Everything else (storage engine, producers, partition splitting) belongs to the log.
//!
//! [`MemoryFeed`] is an in-memory implementation used by tests and the demo binary.

pub mod error;
pub mod feed;
pub mod memory;
pub mod record;

pub use error::{FeedError, Result};
pub use feed::{ChangeFeed, StartFrom};
pub use memory::{FeedFault, MemoryFeed};
pub use record::{Batch, ContinuationToken, Partition, Record};
