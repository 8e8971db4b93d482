//! feedscale Agent
//!
//! A consumer instance of a lease-partitioned change feed. Each agent:
//!
//! - keeps the lease store in step with the feed's partition set ([`PartitionRegistry`])
//! - claims a fair share of partition leases and renews them ([`LeaseManager`])
//! - runs one [`FeedConsumer`] per owned partition, delivering ordered batches to a
//!   [`BatchProcessor`] and checkpointing after each success
//!
//! Delivery is at-least-once. A batch is redelivered when processing fails or when the
//! lease moves between processing and the checkpoint write.
//!
//! ```text
//!              ┌──────────── Agent ────────────┐
//!  change feed │ registry   lease manager      │   lease store
//!  ──────────▶ │    │            │             │ ◀──────────▶
//!              │    ▼            ▼             │
//!              │  consumers (one per lease) ──▶│ BatchProcessor
//!              └───────────────────────────────┘
//! ```

pub mod agent;
pub mod consumer;
pub mod error;
pub mod lease_manager;
pub mod partition_registry;
pub mod processor;
pub mod retry;

pub use agent::{default_instance_id, Agent, AgentBuilder, AgentConfig};
pub use consumer::{ConsumerConfig, ConsumerExit, FeedConsumer};
pub use error::{AgentError, Result};
pub use lease_manager::{CheckpointOutcome, ClaimId, LeaseConfig, LeaseManager, OwnedLeases};
pub use partition_registry::{PartitionRegistry, ReconcileReport};
pub use processor::{
    AlwaysFail, AlwaysSucceed, BatchProcessor, Delivery, FailNthCall, ProcessingError, Recording,
};
pub use retry::{retry_with_backoff, RetryPolicy, RetryableError};
