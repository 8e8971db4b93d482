//! Lag Estimator
//!
//! Compares each partition's checkpoint with the log head using the log's own distance
//! function. Reads leases owned by anyone (or no one) and never writes, so it can run
//! next to live consumers without coordinating with them. A read racing a checkpoint
//! write may be off by one batch; that is accepted.
//!
//! | Lease                          | Lag                              |
//! |--------------------------------|----------------------------------|
//! | missing or retired             | `Unknown`                        |
//! | no checkpoint, start from `Beginning` | `distance(None, head)`    |
//! | no checkpoint, start from `Now`       | `Unknown`                 |
//! | checkpoint                     | `distance(checkpoint, head)`     |

use crate::aggregator::gauge_value;
use crate::error::{Result, ScalerError};
use feedscale_agent::{retry_with_backoff, RetryPolicy};
use feedscale_core::{ChangeFeed, FeedError, Partition, StartFrom};
use feedscale_metadata::{Clock, Lease, LeaseStore};
use feedscale_observability::metrics::{LAG_ESTIMATION_ERRORS_TOTAL, PARTITION_LAG};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Estimated backlog of one partition. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "records")]
pub enum Lag {
    Known(u64),
    Unknown,
}

impl Lag {
    /// Contribution to an aggregate: unknown counts as zero.
    pub fn value(&self) -> u64 {
        match self {
            Lag::Known(n) => *n,
            Lag::Unknown => 0,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Lag::Known(_))
    }
}

/// One partition's entry in a lag snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLag {
    pub partition_id: String,
    pub owner: Option<String>,
    pub lag: Lag,
    /// The estimate failed and the partition contributes zero
    pub degraded: bool,
}

pub struct LagEstimator {
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    start_from: StartFrom,
    retry: RetryPolicy,
}

impl LagEstimator {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        start_from: StartFrom,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            feed,
            store,
            clock,
            start_from,
            retry,
        }
    }

    pub fn start_from(&self) -> StartFrom {
        self.start_from
    }

    /// Estimate one partition's lag. Errors are returned as-is.
    pub async fn estimate_lag(&self, partition_id: &str) -> Result<Lag> {
        let lease =
            retry_with_backoff(&self.retry, "get_lease", || self.store.get(partition_id)).await?;
        let lag = self.lag_for(partition_id, lease.as_ref()).await?;
        self.report(partition_id, lease.as_ref(), lag);
        Ok(lag)
    }

    /// Estimate every partition against one lease snapshot.
    ///
    /// A partition whose estimate fails contributes zero and is marked degraded; only
    /// configuration errors abort the whole snapshot.
    pub async fn estimate_all(&self, partitions: &[Partition]) -> Result<Vec<PartitionLag>> {
        let leases: HashMap<String, Lease> =
            retry_with_backoff(&self.retry, "list_leases", || self.store.list())
                .await?
                .into_iter()
                .map(|lease| (lease.partition_id.clone(), lease))
                .collect();

        let mut lags = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let id = partition.partition_id.as_str();
            let lease = leases.get(id);
            let owner = lease
                .and_then(|l| l.live_owner(self.clock.now_ms()))
                .map(str::to_string);

            match self.lag_for(id, lease).await {
                Ok(lag) => {
                    self.report(id, lease, lag);
                    lags.push(PartitionLag {
                        partition_id: id.to_string(),
                        owner,
                        lag,
                        degraded: false,
                    });
                }
                Err(e) if e.is_configuration() => return Err(e.into()),
                Err(e) => {
                    LAG_ESTIMATION_ERRORS_TOTAL
                        .with_label_values(&["feed"])
                        .inc();
                    warn!(
                        partition_id = %id,
                        error = %e,
                        "Lag estimate failed, partition contributes zero"
                    );
                    PARTITION_LAG.with_label_values(&[id]).set(0);
                    lags.push(PartitionLag {
                        partition_id: id.to_string(),
                        owner,
                        lag: Lag::Unknown,
                        degraded: true,
                    });
                }
            }
        }

        Ok(lags)
    }

    async fn lag_for(
        &self,
        partition_id: &str,
        lease: Option<&Lease>,
    ) -> std::result::Result<Lag, FeedError> {
        let Some(lease) = lease.filter(|l| l.is_active()) else {
            return Ok(Lag::Unknown);
        };

        if lease.checkpoint.is_none() && self.start_from == StartFrom::Now {
            return Ok(Lag::Unknown);
        }

        let head = retry_with_backoff(&self.retry, "head_position", || {
            self.feed.head_position(partition_id)
        })
        .await?;
        let distance = self.feed.distance(lease.checkpoint.as_ref(), &head)?;
        Ok(Lag::Known(distance))
    }

    fn report(&self, partition_id: &str, lease: Option<&Lease>, lag: Lag) {
        PARTITION_LAG
            .with_label_values(&[partition_id])
            .set(gauge_value(lag.value()));

        let now = self.clock.now_ms();
        match lease.and_then(|l| l.live_owner(now)) {
            Some(owner) => info!(
                partition_id = %partition_id,
                owner = %owner,
                lag = ?lag,
                "Lease [{}] owned by host {} reports {} as estimated lag",
                partition_id,
                owner,
                lag.value()
            ),
            None => info!(
                partition_id = %partition_id,
                lag = ?lag,
                "Lease [{}] not owned by any host currently reports {} as estimated lag",
                partition_id,
                lag.value()
            ),
        }
    }
}

/// Lease-store failures while estimating are counted separately from feed failures.
pub(crate) fn record_store_error(error: &ScalerError) {
    LAG_ESTIMATION_ERRORS_TOTAL
        .with_label_values(&["lease_store"])
        .inc();
    warn!(error = %error, "Lease snapshot failed, reporting a degraded metric");
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedscale_core::{FeedFault, MemoryFeed};
    use feedscale_metadata::{ManualClock, MemoryLeaseStore};

    const T0: i64 = 1_700_000_000_000;

    async fn setup(
        start_from: StartFrom,
    ) -> (Arc<MemoryFeed>, Arc<MemoryLeaseStore>, LagEstimator) {
        let feed = Arc::new(MemoryFeed::with_partitions(["0", "1"]));
        feed.append_many("0", 10).await.unwrap();
        feed.append_many("1", 4).await.unwrap();

        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryLeaseStore::with_clock(clock.clone()));
        for id in ["0", "1"] {
            store.conditional_put(Lease::new(id), 0).await.unwrap();
        }

        let estimator = LagEstimator::new(
            feed.clone(),
            store.clone(),
            clock,
            start_from,
            RetryPolicy::no_retry(),
        );
        (feed, store, estimator)
    }

    async fn set_checkpoint(store: &MemoryLeaseStore, id: &str, token: &str) {
        let mut lease = store.get(id).await.unwrap().unwrap();
        let version = lease.version;
        lease.checkpoint = Some(token.into());
        assert!(store.conditional_put(lease, version).await.unwrap().is_written());
    }

    #[tokio::test]
    async fn test_empty_checkpoint_from_beginning_counts_everything() {
        let (_feed, _store, estimator) = setup(StartFrom::Beginning).await;
        assert_eq!(estimator.estimate_lag("0").await.unwrap(), Lag::Known(10));
    }

    #[tokio::test]
    async fn test_empty_checkpoint_from_now_is_unknown() {
        let (_feed, _store, estimator) = setup(StartFrom::Now).await;
        assert_eq!(estimator.estimate_lag("0").await.unwrap(), Lag::Unknown);
    }

    #[tokio::test]
    async fn test_checkpoint_distance_to_head() {
        let (_feed, store, estimator) = setup(StartFrom::Now).await;
        set_checkpoint(&store, "0", "7").await;
        assert_eq!(estimator.estimate_lag("0").await.unwrap(), Lag::Known(3));

        set_checkpoint(&store, "0", "10").await;
        assert_eq!(estimator.estimate_lag("0").await.unwrap(), Lag::Known(0));
    }

    #[tokio::test]
    async fn test_checkpoint_ahead_of_head_is_zero() {
        let (_feed, store, estimator) = setup(StartFrom::Beginning).await;
        set_checkpoint(&store, "1", "9").await;
        assert_eq!(estimator.estimate_lag("1").await.unwrap(), Lag::Known(0));
    }

    #[tokio::test]
    async fn test_missing_lease_is_unknown() {
        let (feed, _store, estimator) = setup(StartFrom::Beginning).await;
        feed.add_partition("2").await;
        assert_eq!(estimator.estimate_lag("2").await.unwrap(), Lag::Unknown);
    }

    #[tokio::test]
    async fn test_failing_partition_is_degraded_not_fatal() {
        let (feed, _store, estimator) = setup(StartFrom::Beginning).await;
        feed.inject_fault("1", FeedFault::Unavailable).await;

        let partitions = vec![Partition::new("0"), Partition::new("1")];
        let lags = estimator.estimate_all(&partitions).await.unwrap();

        assert_eq!(lags[0].lag, Lag::Known(10));
        assert!(!lags[0].degraded);
        assert_eq!(lags[1].lag, Lag::Unknown);
        assert!(lags[1].degraded);
    }

    #[tokio::test]
    async fn test_misconfigured_feed_propagates() {
        let (feed, _store, estimator) = setup(StartFrom::Beginning).await;
        feed.inject_fault("0", FeedFault::Misconfigured).await;

        let partitions = vec![Partition::new("0")];
        let err = estimator.estimate_all(&partitions).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_estimates_report_owner() {
        let (_feed, store, estimator) = setup(StartFrom::Beginning).await;
        let lease = store.get("0").await.unwrap().unwrap();
        let version = lease.version;
        store
            .conditional_put(lease.claimed_by("Instance-a", T0 + 30_000), version)
            .await
            .unwrap();

        let partitions = vec![Partition::new("0"), Partition::new("1")];
        let lags = estimator.estimate_all(&partitions).await.unwrap();
        assert_eq!(lags[0].owner.as_deref(), Some("Instance-a"));
        assert_eq!(lags[1].owner, None);
    }
}
