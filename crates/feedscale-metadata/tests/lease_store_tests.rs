//! Integration tests for lease store implementations
//!
//! Both backends run the same workflow so they stay interchangeable behind
//! `Arc<dyn LeaseStore>`.

use feedscale_metadata::{
    Lease, LeaseStatus, LeaseStore, MemoryLeaseStore, SqliteLeaseStore, WriteOutcome,
};
use std::sync::Arc;

async fn check_lease_workflow(store: &dyn LeaseStore) {
    // Create
    for id in ["0", "1"] {
        let outcome = store.conditional_put(Lease::new(id), 0).await.unwrap();
        assert!(outcome.is_written());
    }
    assert_eq!(store.list().await.unwrap().len(), 2);

    // Claim
    let lease = store.get("0").await.unwrap().unwrap();
    let claimed = store
        .conditional_put(lease.claimed_by("Instance-a", 30_000), lease.version)
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    assert_eq!(claimed.version, 2);

    // Checkpoint
    let mut progressed = claimed.clone();
    progressed.checkpoint = Some("42".into());
    let progressed = store
        .conditional_put(progressed, claimed.version)
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    assert_eq!(progressed.version, 3);

    // A writer holding the claim-time version is refused
    let stale = store
        .conditional_put(claimed.claimed_by("Instance-b", 60_000), claimed.version)
        .await
        .unwrap();
    assert_eq!(
        stale,
        WriteOutcome::Conflict {
            current_version: Some(3)
        }
    );

    let stored = store.get("0").await.unwrap().unwrap();
    assert_eq!(stored.owner.as_deref(), Some("Instance-a"));
    assert_eq!(stored.checkpoint, Some("42".into()));

    // Retire
    let mut retired = stored.released();
    retired.status = LeaseStatus::Retired;
    store.conditional_put(retired, stored.version).await.unwrap();
    let stored = store.get("0").await.unwrap().unwrap();
    assert_eq!(stored.status, LeaseStatus::Retired);
    assert!(stored.owner.is_none());
    // Progress survives retirement
    assert_eq!(stored.checkpoint, Some("42".into()));
}

async fn check_single_winner(store: Arc<dyn LeaseStore>) {
    store.conditional_put(Lease::new("p"), 0).await.unwrap();
    let base = store.get("p").await.unwrap().unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let lease = base.claimed_by(&format!("Instance-{}", i), 30_000);
        handles.push(tokio::spawn(async move {
            store.conditional_put(lease, 1).await.unwrap().is_written()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get("p").await.unwrap().unwrap().version, 2);
}

// ============================================================================
// Memory Tests
// ============================================================================

#[tokio::test]
async fn test_memory_workflow() {
    let store = MemoryLeaseStore::new();
    check_lease_workflow(&store).await;
}

#[tokio::test]
async fn test_memory_single_winner() {
    check_single_winner(Arc::new(MemoryLeaseStore::new())).await;
}

// ============================================================================
// SQLite Tests
// ============================================================================

#[tokio::test]
async fn test_sqlite_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteLeaseStore::new(dir.path().join("leases.db"), "orders")
        .await
        .unwrap();
    check_lease_workflow(&store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteLeaseStore::new(dir.path().join("leases.db"), "orders")
        .await
        .unwrap();
    check_single_winner(Arc::new(store)).await;
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leases.db");

    {
        let store = SqliteLeaseStore::new(&path, "orders").await.unwrap();
        let mut lease = Lease::new("0");
        lease.checkpoint = Some("1000".into());
        store.conditional_put(lease, 0).await.unwrap();
    }

    let reopened = SqliteLeaseStore::new(&path, "orders").await.unwrap();
    let lease = reopened.get("0").await.unwrap().unwrap();
    assert_eq!(lease.checkpoint, Some("1000".into()));
    assert_eq!(lease.version, 1);
}

#[tokio::test]
async fn test_sqlite_processors_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leases.db");

    let orders = SqliteLeaseStore::new(&path, "orders").await.unwrap();
    let audit = SqliteLeaseStore::new(&path, "audit").await.unwrap();

    orders.conditional_put(Lease::new("0"), 0).await.unwrap();

    assert!(audit.get("0").await.unwrap().is_none());
    assert!(audit.list().await.unwrap().is_empty());
    // Same partition id under another processor is a separate lease
    assert!(audit
        .conditional_put(Lease::new("0"), 0)
        .await
        .unwrap()
        .is_written());
}
