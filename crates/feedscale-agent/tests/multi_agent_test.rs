//! Multi-agent integration tests
//!
//! Full agents with background tasks running against one lease store.

use feedscale_agent::{
    Agent, AlwaysSucceed, ConsumerConfig, LeaseConfig, Recording, RetryPolicy,
};
use feedscale_core::{FeedFault, MemoryFeed};
use feedscale_metadata::{LeaseStore, MemoryLeaseStore, SqliteLeaseStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

async fn start_agent(
    instance_id: &str,
    feed: Arc<MemoryFeed>,
    store: Arc<dyn LeaseStore>,
    processor: Arc<Recording<AlwaysSucceed>>,
) -> Agent {
    let agent = Agent::builder()
        .instance_id(instance_id)
        .change_feed(feed)
        .lease_store(store)
        .processor(processor)
        .lease_config(LeaseConfig {
            lease_duration: Duration::from_secs(2),
            acquire_interval: Duration::from_millis(50),
            retry: RetryPolicy::no_retry(),
        })
        .consumer_config(ConsumerConfig {
            max_batch_size: 4,
            poll_delay: Duration::from_millis(10),
            failure_backoff: Duration::from_millis(10),
            retry: RetryPolicy::no_retry(),
            ..Default::default()
        })
        .registry_refresh_interval(Duration::from_millis(50))
        .shutdown_grace(Duration::from_secs(2))
        .build()
        .await
        .unwrap();

    agent.start().await.unwrap();
    agent
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

#[tokio::test]
async fn test_two_agents_share_partitions_and_process_everything() {
    let feed = Arc::new(MemoryFeed::with_partitions(["0", "1", "2", "3"]));
    for partition_id in ["0", "1", "2", "3"] {
        feed.append_many(partition_id, 10).await.unwrap();
    }
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let processor = Arc::new(Recording::new(AlwaysSucceed));

    let a = start_agent("Instance-a", feed.clone(), store.clone(), processor.clone()).await;
    eventually(|| async { a.owned_partitions().await.len() == 4 }).await;

    let b = start_agent("Instance-b", feed.clone(), store.clone(), processor.clone()).await;
    eventually(|| async {
        a.owned_partitions().await.len() == 2 && b.owned_partitions().await.len() == 2
    })
    .await;

    let a_owned = a.owned_partitions().await;
    let b_owned = b.owned_partitions().await;
    assert!(a_owned.is_disjoint(&b_owned));

    // Every record is processed at least once, whichever agent got it
    eventually(|| async {
        ["0", "1", "2", "3"].iter().all(|p| {
            let seen: BTreeSet<String> = processor
                .accepted_positions(p)
                .iter()
                .map(|t| t.to_string())
                .collect();
            seen.len() == 10
        })
    })
    .await;

    // Records added later reach the current owner
    feed.append_many("3", 2).await.unwrap();
    eventually(|| async { processor.accepted_positions("3").len() >= 12 }).await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();

    for lease in store.list().await.unwrap() {
        assert!(lease.owner.is_none(), "{} still owned", lease.partition_id);
        assert!(lease.checkpoint.is_some());
    }
    assert_eq!(
        store.get("3").await.unwrap().unwrap().checkpoint,
        Some("12".into())
    );
}

#[tokio::test]
async fn test_stopped_agent_hands_over_with_checkpoints() {
    let temp_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn LeaseStore> = Arc::new(
        SqliteLeaseStore::new(temp_dir.path().join("leases.db"), "handover")
            .await
            .unwrap(),
    );
    let feed = Arc::new(MemoryFeed::with_partitions(["0", "1"]));
    feed.append_many("0", 8).await.unwrap();
    feed.append_many("1", 8).await.unwrap();

    let first = Arc::new(Recording::new(AlwaysSucceed));
    let a = start_agent("Instance-a", feed.clone(), store.clone(), first.clone()).await;
    eventually(|| async {
        first.accepted_positions("0").len() == 8 && first.accepted_positions("1").len() == 8
    })
    .await;
    a.stop().await.unwrap();

    // The next agent resumes from the released checkpoints
    let second = Arc::new(Recording::new(AlwaysSucceed));
    let b = start_agent("Instance-b", feed.clone(), store.clone(), second.clone()).await;
    eventually(|| async { b.owned_partitions().await.len() == 2 }).await;

    feed.append_many("0", 1).await.unwrap();
    eventually(|| async { second.accepted_positions("0").len() == 1 }).await;

    assert_eq!(second.accepted_positions("0")[0].as_str(), "8");
    assert!(second.accepted_positions("1").is_empty());

    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_removed_partition_is_retired_and_released() {
    let feed = Arc::new(MemoryFeed::with_partitions(["0", "1"]));
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let processor = Arc::new(Recording::new(AlwaysSucceed));

    let agent = start_agent("Instance-a", feed.clone(), store.clone(), processor).await;
    eventually(|| async { agent.owned_partitions().await.len() == 2 }).await;

    feed.remove_partition("1").await;
    eventually(|| async {
        let lease = store.get("1").await.unwrap().unwrap();
        !lease.is_active() && !agent.owned_partitions().await.contains("1")
    })
    .await;

    assert!(agent.fatal().is_none());
    agent.stop().await.unwrap();
}

#[tokio::test]
async fn test_misconfigured_feed_fails_start() {
    let feed = Arc::new(MemoryFeed::with_partitions(["0"]));
    feed.inject_global_fault(FeedFault::Misconfigured).await;

    let agent = Agent::builder()
        .instance_id("Instance-a")
        .change_feed(feed)
        .lease_store(Arc::new(MemoryLeaseStore::new()))
        .processor(Arc::new(AlwaysSucceed))
        .build()
        .await
        .unwrap();

    let err = agent.start().await.unwrap_err();
    assert!(err.is_configuration());
    assert!(!agent.is_started().await);
}

#[tokio::test]
async fn test_fatal_consumer_error_is_reported() {
    let feed = Arc::new(MemoryFeed::with_partitions(["0"]));
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let processor = Arc::new(Recording::new(AlwaysSucceed));

    let agent = start_agent("Instance-a", feed.clone(), store, processor).await;
    let mut fatal = agent.subscribe_fatal();

    feed.inject_fault("0", FeedFault::Misconfigured).await;

    tokio::time::timeout(Duration::from_secs(3), fatal.wait_for(|f| f.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert!(agent.fatal().is_some());

    agent.stop().await.unwrap();
}
