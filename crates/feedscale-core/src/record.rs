//! Records, Batches and Continuation Tokens
//!
//! ## Continuation Tokens
//!
//! A `ContinuationToken` is opaque to feedscale. The log hands one out with every batch
//! (the position right after the batch) and for every head query. feedscale stores the
//! token of the last fully processed batch as the lease checkpoint and gives it back to
//! the log to resume. Only the log knows how to order or subtract tokens.
//!
//! ## Batches
//!
//! A batch is the unit of delivery and of checkpointing: records arrive in log order and
//! the checkpoint jumps from the batch's start straight to `continuation`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque position in a partition, defined by the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContinuationToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContinuationToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A shard of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    /// Stable identifier assigned by the log
    pub partition_id: String,
}

impl Partition {
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
        }
    }
}

/// A single record read from the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Position of this record in its partition
    pub position: ContinuationToken,

    /// Timestamp in milliseconds since epoch
    pub timestamp: u64,

    /// Optional key
    pub key: Option<Bytes>,

    /// Value (payload)
    pub value: Bytes,
}

impl Record {
    pub fn new(
        position: ContinuationToken,
        timestamp: u64,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Self {
        Self {
            position,
            timestamp,
            key,
            value,
        }
    }

    /// Estimate the size of this record in bytes
    pub fn estimated_size(&self) -> usize {
        self.position.as_str().len()
            + 8
            + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.value.len()
    }
}

/// Ordered run of records pulled from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub partition_id: String,

    /// Records in log order
    pub records: Vec<Record>,

    /// Token to resume from once this batch is processed. Equal to the
    /// starting token when the batch is empty.
    pub continuation: ContinuationToken,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.records.iter().map(Record::estimated_size).sum()
    }
}
