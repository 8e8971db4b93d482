//! feedscale Scaler
//!
//! Global, read-only view of consumption progress for an external autoscaler:
//!
//! - [`LagEstimator`]: per-partition distance between checkpoint and log head
//! - [`ScaleMetricAggregator`]: reduces all partitions' lag into one [`ScaleMetric`]
//! - [`service`]: HTTP endpoints the autoscaler polls
//!
//! Nothing here writes to the lease store, so a scaler can run next to agents, inside one
//! of them, or on its own.
//!
//! ```ignore
//! let registry = Arc::new(PartitionRegistry::new(feed.clone(), store.clone(), RetryPolicy::default()));
//! let estimator = LagEstimator::new(feed, store, clock.clone(), StartFrom::Beginning, RetryPolicy::default());
//! let aggregator = ScaleMetricAggregator::new(registry, estimator, AggregationPolicy::TotalLag, clock);
//!
//! let metric = aggregator.current_metric().await?;
//! ```

pub mod aggregator;
pub mod error;
pub mod lag_estimator;
pub mod service;

pub use aggregator::{AggregationPolicy, ScaleMetric, ScaleMetricAggregator};
pub use error::{Result, ScalerError};
pub use lag_estimator::{Lag, LagEstimator, PartitionLag};
pub use service::{create_router, AppState, ScalerServer};
