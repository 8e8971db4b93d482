//! Feed Consumer - one loop per owned partition
//!
//! ## Loop
//!
//! ```text
//!        ┌──────────────────────────────────────────────────────────┐
//!        ▼                                                          │
//!   stop requested? ──yes──▶ final checkpoint attempt ──▶ Shutdown  │
//!        │ no                                                       │
//!   still own lease? ──no──▶ OwnershipLost                          │
//!        │ yes                                                      │
//!   pending checkpoint? ──▶ write it (conflict ──▶ OwnershipLost)   │
//!        │                                                          │
//!   read batch from position ──empty──▶ sleep poll_delay ───────────┤
//!        │                                                          │
//!   process ──fail──▶ sleep failure_backoff (same batch again) ─────┤
//!        │ ok                                                       │
//!   position = batch.continuation, pending = position ──────────────┘
//! ```
//!
//! A batch is atomic with respect to the checkpoint: either its end token is written or
//! nothing is. A checkpoint that failed because the store was unreachable stays pending
//! and is written before the next read, so the consumer never runs ahead of what it can
//! make durable.
//!
//! A consumer is bound to the lease claim it started under. Once that claim is gone the
//! consumer stops, even if the same instance has claimed the partition again.

use crate::error::AgentError;
use crate::lease_manager::{CheckpointOutcome, ClaimId, LeaseManager};
use crate::processor::BatchProcessor;
use crate::retry::{retry_with_backoff, RetryPolicy};
use feedscale_core::{ChangeFeed, ContinuationToken, FeedError, StartFrom};
use feedscale_observability::metrics::{
    BATCHES_PROCESSED_TOTAL, BATCH_PROCESSING_SECONDS, CHECKPOINTS_TOTAL,
    CHECKPOINT_CONFLICTS_TOTAL, PROCESSING_FAILURES_TOTAL, RECORDS_PROCESSED_TOTAL,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound on records per batch
    pub max_batch_size: usize,

    /// Wait after reading an empty batch
    pub poll_delay: Duration,

    /// Wait after a processing, read or checkpoint failure
    pub failure_backoff: Duration,

    /// Where a partition without a checkpoint starts
    pub start_from: StartFrom,

    /// Backoff for transient change feed failures
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            poll_delay: Duration::from_secs(1),
            failure_backoff: Duration::from_secs(1),
            start_from: StartFrom::Beginning,
            retry: RetryPolicy::default(),
        }
    }
}

/// Why a consumer loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Stop was requested
    Shutdown,
    /// The lease expired or another instance wrote it
    OwnershipLost,
    /// The partition no longer exists in the log
    PartitionGone,
    /// A configuration-class error; retrying will not help
    Fatal(String),
}

pub struct FeedConsumer {
    partition_id: String,
    feed: Arc<dyn ChangeFeed>,
    leases: Arc<LeaseManager>,
    processor: Arc<dyn BatchProcessor>,
    config: ConsumerConfig,
    claim: Option<ClaimId>,
}

impl FeedConsumer {
    pub fn new(
        partition_id: impl Into<String>,
        feed: Arc<dyn ChangeFeed>,
        leases: Arc<LeaseManager>,
        processor: Arc<dyn BatchProcessor>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            feed,
            leases,
            processor,
            config,
            claim: None,
        }
    }

    /// Only consume under `claim`; without this the claim current at start is used.
    pub fn for_claim(mut self, claim: ClaimId) -> Self {
        self.claim = Some(claim);
        self
    }

    /// Consume until ownership is lost or `stop` flips to true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> ConsumerExit {
        info!(
            instance_id = %self.leases.instance_id(),
            partition_id = %self.partition_id,
            "Consumer started"
        );

        let exit = self.consume(&mut stop).await;

        info!(
            instance_id = %self.leases.instance_id(),
            partition_id = %self.partition_id,
            exit = ?exit,
            "Consumer stopped"
        );
        exit
    }

    async fn consume(&self, stop: &mut watch::Receiver<bool>) -> ConsumerExit {
        let Some((claim, lease)) = self.leases.current_claim(&self.partition_id).await else {
            return ConsumerExit::OwnershipLost;
        };
        if self.claim.is_some_and(|expected| expected != claim) {
            return ConsumerExit::OwnershipLost;
        }

        let mut position = lease.checkpoint.clone();
        let mut pending: Option<ContinuationToken> = None;

        if position.is_none() && self.config.start_from == StartFrom::Now {
            // Pin the head as the first checkpoint so a later owner starts from the same place
            loop {
                if is_stopping(stop) {
                    return ConsumerExit::Shutdown;
                }
                match retry_with_backoff(&self.config.retry, "head_position", || {
                    self.feed.head_position(&self.partition_id)
                })
                .await
                {
                    Ok(head) => {
                        debug!(partition_id = %self.partition_id, head = %head, "Starting from head");
                        position = Some(head.clone());
                        pending = Some(head);
                        break;
                    }
                    Err(e) => match self.feed_exit(e) {
                        Some(exit) => return exit,
                        None => pause(stop, self.config.failure_backoff).await,
                    },
                }
            }
        }

        loop {
            if is_stopping(stop) {
                if let Some(token) = pending.take() {
                    self.final_checkpoint(claim, token).await;
                }
                return ConsumerExit::Shutdown;
            }

            if !self.leases.holds(&self.partition_id, claim).await {
                return ConsumerExit::OwnershipLost;
            }

            if let Some(token) = pending.clone() {
                match self
                    .leases
                    .checkpoint_claim(&self.partition_id, claim, token)
                    .await
                {
                    Ok(CheckpointOutcome::Committed { version }) => {
                        CHECKPOINTS_TOTAL
                            .with_label_values(&[self.partition_id.as_str()])
                            .inc();
                        debug!(
                            partition_id = %self.partition_id,
                            version,
                            "Checkpoint committed"
                        );
                        pending = None;
                    }
                    Ok(CheckpointOutcome::Conflict) => {
                        CHECKPOINT_CONFLICTS_TOTAL
                            .with_label_values(&[self.partition_id.as_str()])
                            .inc();
                        info!(
                            instance_id = %self.leases.instance_id(),
                            partition_id = %self.partition_id,
                            "Ownership moved before checkpoint, stopping"
                        );
                        return ConsumerExit::OwnershipLost;
                    }
                    Err(e) => match self.checkpoint_exit(e) {
                        Some(exit) => return exit,
                        None => {
                            pause(stop, self.config.failure_backoff).await;
                            continue;
                        }
                    },
                }
            }

            let batch = match retry_with_backoff(&self.config.retry, "read_from", || {
                self.feed.read_from(
                    &self.partition_id,
                    position.as_ref(),
                    self.config.max_batch_size,
                )
            })
            .await
            {
                Ok(batch) => batch,
                Err(e) => match self.feed_exit(e) {
                    Some(exit) => return exit,
                    None => {
                        pause(stop, self.config.failure_backoff).await;
                        continue;
                    }
                },
            };

            if batch.is_empty() {
                pause(stop, self.config.poll_delay).await;
                continue;
            }

            let timer = BATCH_PROCESSING_SECONDS
                .with_label_values(&[self.partition_id.as_str()])
                .start_timer();
            let result = self.processor.process(&batch).await;
            timer.observe_duration();

            match result {
                Ok(()) => {
                    RECORDS_PROCESSED_TOTAL
                        .with_label_values(&[self.partition_id.as_str()])
                        .inc_by(batch.len() as u64);
                    BATCHES_PROCESSED_TOTAL
                        .with_label_values(&[self.partition_id.as_str()])
                        .inc();
                    position = Some(batch.continuation.clone());
                    pending = Some(batch.continuation);
                }
                Err(e) => {
                    PROCESSING_FAILURES_TOTAL
                        .with_label_values(&[self.partition_id.as_str()])
                        .inc();
                    warn!(
                        partition_id = %self.partition_id,
                        records = batch.len(),
                        error = %e,
                        "Batch processing failed, will redeliver"
                    );
                    pause(stop, self.config.failure_backoff).await;
                }
            }
        }
    }

    async fn final_checkpoint(&self, claim: ClaimId, token: ContinuationToken) {
        match self
            .leases
            .checkpoint_claim(&self.partition_id, claim, token)
            .await
        {
            Ok(CheckpointOutcome::Committed { .. }) => {
                CHECKPOINTS_TOTAL
                    .with_label_values(&[self.partition_id.as_str()])
                    .inc();
            }
            Ok(CheckpointOutcome::Conflict) => {
                debug!(
                    partition_id = %self.partition_id,
                    "Final checkpoint skipped, ownership already moved"
                );
            }
            Err(e) => {
                warn!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "Final checkpoint failed, last batch will be redelivered"
                );
            }
        }
    }

    /// `None` means back off and try again. Only configuration errors are fatal.
    fn feed_exit(&self, e: FeedError) -> Option<ConsumerExit> {
        match e {
            FeedError::PartitionNotFound(_) => Some(ConsumerExit::PartitionGone),
            e if e.is_configuration() => {
                error!(partition_id = %self.partition_id, error = %e, "Change feed misconfigured");
                Some(ConsumerExit::Fatal(e.to_string()))
            }
            e if e.is_transient() => {
                warn!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "Change feed unavailable, backing off"
                );
                None
            }
            e => {
                error!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "Change feed rejected the read, backing off"
                );
                None
            }
        }
    }

    fn checkpoint_exit(&self, e: AgentError) -> Option<ConsumerExit> {
        if e.is_configuration() {
            error!(partition_id = %self.partition_id, error = %e, "Checkpoint failed");
            return Some(ConsumerExit::Fatal(e.to_string()));
        }
        warn!(
            partition_id = %self.partition_id,
            error = %e,
            "Checkpoint failed, keeping it pending"
        );
        None
    }
}

fn is_stopping(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = stop.changed() => {}
    }
}
