//! In-memory lease store for tests and single-process demos.
//!
//! Same conditional-write semantics as `SqliteLeaseStore`, with a switch to simulate
//! the store becoming unreachable.

use crate::clock::{Clock, SystemClock};
use crate::error::{MetadataError, Result};
use crate::types::{Lease, WriteOutcome};
use crate::LeaseStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct MemoryLeaseStore {
    leases: RwLock<BTreeMap<String, Lease>>,
    unavailable: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for `updated_at` stamps.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
            clock,
        }
    }

    /// While set, every call fails with `MetadataError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable(
                "in-memory lease store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, partition_id: &str) -> Result<Option<Lease>> {
        self.check_available()?;
        Ok(self.leases.read().await.get(partition_id).cloned())
    }

    async fn conditional_put(&self, mut lease: Lease, expected_version: u64) -> Result<WriteOutcome> {
        self.check_available()?;
        let mut leases = self.leases.write().await;

        let current_version = leases.get(&lease.partition_id).map(|l| l.version);
        let matches = match current_version {
            None => expected_version == 0,
            Some(v) => v == expected_version,
        };
        if !matches {
            return Ok(WriteOutcome::Conflict { current_version });
        }

        lease.version = expected_version + 1;
        lease.updated_at = self.clock.now_ms();
        leases.insert(lease.partition_id.clone(), lease.clone());
        Ok(WriteOutcome::Written(lease))
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        self.check_available()?;
        Ok(self.leases.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_create_only_once() {
        let store = MemoryLeaseStore::new();

        let first = store.conditional_put(Lease::new("0"), 0).await.unwrap();
        let stored = first.into_lease().unwrap();
        assert_eq!(stored.version, 1);

        let second = store.conditional_put(Lease::new("0"), 0).await.unwrap();
        assert_eq!(
            second,
            WriteOutcome::Conflict {
                current_version: Some(1)
            }
        );
    }

    #[tokio::test]
    async fn test_update_requires_matching_version() {
        let store = MemoryLeaseStore::new();
        store.conditional_put(Lease::new("0"), 0).await.unwrap();

        let lease = store.get("0").await.unwrap().unwrap();
        let claimed = lease.claimed_by("a", 10_000);

        let written = store.conditional_put(claimed.clone(), 1).await.unwrap();
        assert!(written.is_written());

        // Stale writer still holding version 1
        let stale = store
            .conditional_put(lease.claimed_by("b", 10_000), 1)
            .await
            .unwrap();
        assert_eq!(
            stale,
            WriteOutcome::Conflict {
                current_version: Some(2)
            }
        );

        let stored = store.get("0").await.unwrap().unwrap();
        assert_eq!(stored.owner.as_deref(), Some("a"));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_update_of_missing_lease_conflicts() {
        let store = MemoryLeaseStore::new();
        let outcome = store.conditional_put(Lease::new("9"), 3).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Conflict {
                current_version: None
            }
        );
    }

    #[tokio::test]
    async fn test_updated_at_uses_clock() {
        let clock = Arc::new(ManualClock::new(42));
        let store = MemoryLeaseStore::with_clock(clock.clone());
        let lease = store
            .conditional_put(Lease::new("0"), 0)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(lease.updated_at, 42);
    }

    #[tokio::test]
    async fn test_unavailable_switch() {
        let store = MemoryLeaseStore::new();
        store.set_unavailable(true);

        let err = store.list().await.unwrap_err();
        assert!(err.is_transient());

        store.set_unavailable(false);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let store = MemoryLeaseStore::new();
        for id in ["2", "0", "1"] {
            store.conditional_put(Lease::new(id), 0).await.unwrap();
        }
        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.partition_id)
            .collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }
}
