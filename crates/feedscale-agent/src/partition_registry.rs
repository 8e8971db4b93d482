//! Partition Registry
//!
//! Tracks the partition set of the change feed and keeps the lease store in step with it.
//!
//! ## Reconciliation
//!
//! | Log          | Lease store       | Action                                       |
//! |--------------|-------------------|----------------------------------------------|
//! | present      | missing           | create unowned lease, empty checkpoint       |
//! | present      | active            | nothing                                      |
//! | present      | retired           | revive: `generation + 1`, checkpoint cleared |
//! | missing      | active            | retire: owner cleared, checkpoint kept       |
//! | missing      | retired           | nothing                                      |
//!
//! A partition id the log reuses after retirement never inherits the old checkpoint.
//! Every write goes through `conditional_put`, so several instances reconciling at once
//! is harmless: the losers see a conflict and the winner's write stands.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = PartitionRegistry::new(feed, store, RetryPolicy::default());
//!
//! // Agents: keep leases in step with the log
//! let report = registry.reconcile().await?;
//!
//! // Scaler: read-only view of the current partitions
//! let partitions = registry.discover().await?;
//! ```

use crate::error::Result;
use crate::retry::{retry_with_backoff, RetryPolicy};
use feedscale_core::{ChangeFeed, Partition};
use feedscale_metadata::{Lease, LeaseStatus, LeaseStore, WriteOutcome};
use feedscale_observability::metrics::PARTITIONS_TOTAL;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// What one `reconcile` pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub revived: Vec<String>,
    pub retired: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.revived.is_empty() && self.retired.is_empty()
    }
}

pub struct PartitionRegistry {
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn LeaseStore>,
    retry: RetryPolicy,
    partitions: RwLock<Vec<Partition>>,
}

impl PartitionRegistry {
    pub fn new(feed: Arc<dyn ChangeFeed>, store: Arc<dyn LeaseStore>, retry: RetryPolicy) -> Self {
        Self {
            feed,
            store,
            retry,
            partitions: RwLock::new(Vec::new()),
        }
    }

    /// Last known partition set, ordered by id.
    pub async fn list_partitions(&self) -> Vec<Partition> {
        self.partitions.read().await.clone()
    }

    /// Refresh the partition set from the feed without touching leases.
    ///
    /// A transient feed failure keeps the last known set; configuration errors propagate.
    pub async fn discover(&self) -> Result<Vec<Partition>> {
        match self.refresh().await {
            Ok(partitions) => Ok(partitions),
            Err(e) if e.is_transient() => {
                let known = self.list_partitions().await;
                warn!(
                    error = %e,
                    known_partitions = known.len(),
                    "Partition discovery failed, keeping last known set"
                );
                Ok(known)
            }
            Err(e) => Err(e),
        }
    }

    /// Discover partitions and create, revive or retire leases to match.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let partitions = self.refresh().await?;
        let leases = retry_with_backoff(&self.retry, "list_leases", || self.store.list()).await?;

        let mut by_id: HashMap<String, Lease> = leases
            .into_iter()
            .map(|lease| (lease.partition_id.clone(), lease))
            .collect();
        let live: BTreeSet<&str> = partitions.iter().map(|p| p.partition_id.as_str()).collect();

        let mut report = ReconcileReport::default();

        for partition in &partitions {
            let id = &partition.partition_id;
            match by_id.remove(id) {
                None => {
                    if self.write(Lease::new(id.clone()), 0).await? {
                        info!(partition_id = %id, "Created lease for new partition");
                        report.created.push(id.clone());
                    }
                }
                Some(lease) if lease.status == LeaseStatus::Retired => {
                    let revived = Lease {
                        owner: None,
                        expires_at: 0,
                        checkpoint: None,
                        generation: lease.generation + 1,
                        status: LeaseStatus::Active,
                        takeover_by: None,
                        ..lease.clone()
                    };
                    if self.write(revived, lease.version).await? {
                        info!(
                            partition_id = %id,
                            generation = lease.generation + 1,
                            "Partition id reused by the log, lease reset"
                        );
                        report.revived.push(id.clone());
                    }
                }
                Some(_) => {}
            }
        }

        // Whatever is left in `by_id` no longer exists in the log
        for (id, lease) in by_id {
            if lease.status == LeaseStatus::Retired || live.contains(id.as_str()) {
                continue;
            }
            let mut retired = lease.released();
            retired.status = LeaseStatus::Retired;
            if self.write(retired, lease.version).await? {
                info!(
                    partition_id = %id,
                    previous_owner = ?lease.owner,
                    checkpoint = ?lease.checkpoint,
                    "Partition left the log, lease retired"
                );
                report.retired.push(id);
            }
        }

        report.retired.sort();
        if !report.is_empty() {
            debug!(?report, "Reconciled leases with partition set");
        }
        Ok(report)
    }

    /// Reconcile every `interval` until `shutdown` flips. Configuration errors end the loop.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        if e.is_configuration() {
                            error!(error = %e, "Partition reconcile failed with configuration error");
                            return Err(e);
                        }
                        warn!(error = %e, "Partition reconcile failed, will retry next tick");
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn refresh(&self) -> Result<Vec<Partition>> {
        let mut partitions =
            retry_with_backoff(&self.retry, "list_partitions", || self.feed.list_partitions())
                .await?;
        partitions.sort();
        partitions.dedup();

        PARTITIONS_TOTAL.set(partitions.len() as i64);
        *self.partitions.write().await = partitions.clone();
        Ok(partitions)
    }

    async fn write(&self, lease: Lease, expected_version: u64) -> Result<bool> {
        let outcome = retry_with_backoff(&self.retry, "reconcile_lease", || {
            self.store.conditional_put(lease.clone(), expected_version)
        })
        .await?;

        Ok(matches!(outcome, WriteOutcome::Written(_)))
    }
}
