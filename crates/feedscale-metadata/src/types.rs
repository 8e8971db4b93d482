//! Lease Records
//!
//! One `Lease` exists per change-feed partition. Together the leases are the entire
//! durable state of a feedscale deployment:
//!
//! ```text
//! partition_id | owner        | expires_at    | checkpoint | version | generation | status  | takeover_by
//! -------------+--------------+---------------+------------+---------+------------+---------+------------
//! 0            | Instance-a   | 1700000030000 | 1250       | 17      | 1          | active  | NULL
//! 1            | NULL         | 0             | NULL       | 1       | 1          | active  | NULL
//! 2            | NULL         | 0             | 900        | 44      | 1          | retired | NULL
//! 3            | Instance-a   | 1700000031000 | 310        | 9       | 1          | active  | Instance-b
//! ```
//!
//! ## Ownership
//!
//! A lease is *live* when it has an owner and `expires_at` is in the future. Only the
//! live owner may checkpoint. An owner that stops renewing loses the lease once
//! `expires_at` passes, without anybody having to notice the crash.
//!
//! ## Versions
//!
//! Every successful write bumps `version` by one. Writers pass the version they last
//! read; a mismatch means somebody else wrote in between and the write is refused.
//!
//! ## Handoff
//!
//! A live lease is never overwritten by another instance. An instance that wants it sets
//! `takeover_by` instead (row 3 above). The owner's next write on the lease conflicts,
//! and the owner answers by writing the lease over to the requester.

use feedscale_core::ContinuationToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MetadataError;

/// Lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Partition exists in the log and may be consumed
    Active,
    /// Partition disappeared from the log; kept for inspection, never consumed
    Retired,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Active => "active",
            LeaseStatus::Retired => "retired",
        }
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseStatus {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LeaseStatus::Active),
            "retired" => Ok(LeaseStatus::Retired),
            other => Err(MetadataError::InvalidRecord(format!(
                "unknown lease status '{}'",
                other
            ))),
        }
    }
}

/// Ownership and progress record for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Partition this lease covers
    pub partition_id: String,

    /// Instance currently consuming the partition, if any
    pub owner: Option<String>,

    /// Lease expiration timestamp (milliseconds since Unix epoch)
    pub expires_at: i64,

    /// Token after the last successfully processed batch
    pub checkpoint: Option<ContinuationToken>,

    /// Optimistic-concurrency version, bumped on every write. 0 = never written.
    pub version: u64,

    /// Incremented each time a retired lease is reset for a reused partition id
    pub generation: u64,

    pub status: LeaseStatus,

    /// Instance waiting for the current owner to hand this lease over
    #[serde(default)]
    pub takeover_by: Option<String>,

    /// Last write timestamp (milliseconds since Unix epoch)
    pub updated_at: i64,
}

impl Lease {
    /// A fresh, unowned lease that has not been stored yet.
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner: None,
            expires_at: 0,
            checkpoint: None,
            version: 0,
            generation: 1,
            status: LeaseStatus::Active,
            takeover_by: None,
            updated_at: 0,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.status == LeaseStatus::Active
    }

    /// Owner whose claim has not expired yet.
    pub fn live_owner(&self, now_ms: i64) -> Option<&str> {
        match &self.owner {
            Some(owner) if !self.is_expired(now_ms) => Some(owner.as_str()),
            _ => None,
        }
    }

    pub fn is_owned_by(&self, instance_id: &str, now_ms: i64) -> bool {
        self.live_owner(now_ms) == Some(instance_id)
    }

    /// Active and nobody holds a live claim.
    pub fn is_available(&self, now_ms: i64) -> bool {
        self.is_active() && self.live_owner(now_ms).is_none()
    }

    /// Instance asking the live owner to hand the lease over, if any.
    pub fn pending_takeover(&self, now_ms: i64) -> Option<&str> {
        self.live_owner(now_ms)?;
        self.takeover_by.as_deref()
    }

    /// Copy of this lease claimed by `owner` until `expires_at`. Clears any takeover request.
    pub fn claimed_by(&self, owner: &str, expires_at: i64) -> Self {
        Self {
            owner: Some(owner.to_string()),
            expires_at,
            takeover_by: None,
            ..self.clone()
        }
    }

    /// Copy of this lease with no owner.
    pub fn released(&self) -> Self {
        Self {
            owner: None,
            expires_at: 0,
            takeover_by: None,
            ..self.clone()
        }
    }

    /// Copy of this lease, still held by its owner, carrying a takeover request.
    pub fn with_takeover_request(&self, requester: &str) -> Self {
        Self {
            takeover_by: Some(requester.to_string()),
            ..self.clone()
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied; carries the lease as stored (with its new version)
    Written(Lease),
    /// The stored version did not match the expected one. `current_version` is
    /// `None` when the lease does not exist.
    Conflict { current_version: Option<u64> },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written(_))
    }

    pub fn into_lease(self) -> Option<Lease> {
        match self {
            WriteOutcome::Written(lease) => Some(lease),
            WriteOutcome::Conflict { .. } => None,
        }
    }
}
