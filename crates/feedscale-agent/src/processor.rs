//! Batch processing callback.
//!
//! The business side of a deployment implements [`BatchProcessor`]; feedscale only
//! promises to hand it batches in log order and to checkpoint after it returns `Ok`.
//! A batch can be delivered more than once (after a failure, or when ownership moves
//! between processing and checkpointing), so implementations must tolerate redelivery.
//!
//! The stub processors at the bottom are deterministic building blocks for tests.

use async_trait::async_trait;
use feedscale_core::{Batch, ContinuationToken};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// The processor rejected a batch. It will be redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch processing failed: {0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, batch: &Batch) -> Result<(), ProcessingError>;
}

#[async_trait]
impl<P: BatchProcessor + ?Sized> BatchProcessor for Arc<P> {
    async fn process(&self, batch: &Batch) -> Result<(), ProcessingError> {
        (**self).process(batch).await
    }
}

/// Accepts every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSucceed;

#[async_trait]
impl BatchProcessor for AlwaysSucceed {
    async fn process(&self, _batch: &Batch) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Rejects every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysFail;

#[async_trait]
impl BatchProcessor for AlwaysFail {
    async fn process(&self, batch: &Batch) -> Result<(), ProcessingError> {
        Err(ProcessingError::new(format!(
            "rejecting {} records from partition {}",
            batch.len(),
            batch.partition_id
        )))
    }
}

/// Fails only the `n`th call (1-based), succeeding before and after.
#[derive(Debug)]
pub struct FailNthCall {
    n: usize,
    calls: AtomicUsize,
}

impl FailNthCall {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchProcessor for FailNthCall {
    async fn process(&self, _batch: &Batch) -> Result<(), ProcessingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.n {
            return Err(ProcessingError::new(format!("injected failure on call {}", call)));
        }
        Ok(())
    }
}

/// One batch as seen by a [`Recording`] processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition_id: String,
    pub positions: Vec<ContinuationToken>,
    pub continuation: ContinuationToken,
    pub accepted: bool,
}

/// Records every delivery, then defers to the wrapped processor.
pub struct Recording<P> {
    inner: P,
    deliveries: Mutex<Vec<Delivery>>,
}

impl<P: BatchProcessor> Recording<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            deliveries: Mutex::new(Vec::new()),
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Positions of accepted records for one partition, in delivery order.
    pub fn accepted_positions(&self, partition_id: &str) -> Vec<ContinuationToken> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.accepted && d.partition_id == partition_id)
            .flat_map(|d| d.positions)
            .collect()
    }
}

#[async_trait]
impl<P: BatchProcessor> BatchProcessor for Recording<P> {
    async fn process(&self, batch: &Batch) -> Result<(), ProcessingError> {
        let result = self.inner.process(batch).await;

        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push(Delivery {
                partition_id: batch.partition_id.clone(),
                positions: batch.records.iter().map(|r| r.position.clone()).collect(),
                continuation: batch.continuation.clone(),
                accepted: result.is_ok(),
            });
        }

        result
    }
}
