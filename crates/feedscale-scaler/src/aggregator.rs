//! Scale Metric Aggregator
//!
//! Reduces the lag of every partition the registry knows about (owned or not) into the
//! single number an external autoscaler polls. The metric always has a value: partitions
//! whose estimate failed count as zero and the result is flagged `degraded`.

use crate::error::{Result, ScalerError};
use crate::lag_estimator::{record_store_error, Lag, LagEstimator, PartitionLag};
use feedscale_agent::PartitionRegistry;
use feedscale_metadata::Clock;
use feedscale_observability::metrics::SCALE_METRIC;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// How per-partition lags are reduced to one value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationPolicy {
    /// Number of partitions with lag > 0
    #[default]
    #[serde(rename = "active_partitions")]
    ActivePartitionCount,
    /// Sum of all lags
    #[serde(rename = "total_lag")]
    TotalLag,
}

impl AggregationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPolicy::ActivePartitionCount => "active_partitions",
            AggregationPolicy::TotalLag => "total_lag",
        }
    }

    pub fn reduce<'a>(&self, lags: impl IntoIterator<Item = &'a Lag>) -> u64 {
        let values = lags.into_iter().map(Lag::value);
        match self {
            AggregationPolicy::ActivePartitionCount => values.filter(|v| *v > 0).count() as u64,
            // Approximate distances can be huge; pin at the maximum instead of wrapping
            AggregationPolicy::TotalLag => values.fold(0u64, u64::saturating_add),
        }
    }
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationPolicy {
    type Err = ScalerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active_partitions" => Ok(AggregationPolicy::ActivePartitionCount),
            "total_lag" => Ok(AggregationPolicy::TotalLag),
            other => Err(ScalerError::Config(format!(
                "unknown aggregation policy '{}', expected active_partitions or total_lag",
                other
            ))),
        }
    }
}

/// The value handed to the autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleMetric {
    pub value: u64,
    pub policy: AggregationPolicy,
    pub timestamp_ms: i64,
    pub partition_count: usize,
    pub degraded: bool,
}

pub struct ScaleMetricAggregator {
    registry: Arc<PartitionRegistry>,
    estimator: LagEstimator,
    policy: AggregationPolicy,
    clock: Arc<dyn Clock>,
}

impl ScaleMetricAggregator {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        estimator: LagEstimator,
        policy: AggregationPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            estimator,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    pub fn estimator(&self) -> &LagEstimator {
        &self.estimator
    }

    /// Compute the metric now. Only configuration errors are returned.
    pub async fn current_metric(&self) -> Result<ScaleMetric> {
        let (metric, _) = self.snapshot().await?;
        Ok(metric)
    }

    /// The metric together with the per-partition estimates it was reduced from.
    pub async fn snapshot(&self) -> Result<(ScaleMetric, Vec<PartitionLag>)> {
        let partitions = self.registry.discover().await?;

        let (lags, store_failed) = match self.estimator.estimate_all(&partitions).await {
            Ok(lags) => (lags, false),
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                record_store_error(&e);
                (Vec::new(), true)
            }
        };

        let value = self.policy.reduce(lags.iter().map(|l| &l.lag));
        let degraded = store_failed || lags.iter().any(|l| l.degraded);

        let metric = ScaleMetric {
            value,
            policy: self.policy,
            timestamp_ms: self.clock.now_ms(),
            partition_count: partitions.len(),
            degraded,
        };

        SCALE_METRIC
            .with_label_values(&[self.policy.as_str()])
            .set(gauge_value(value));

        if degraded {
            info!(
                policy = %self.policy,
                value,
                partitions = partitions.len(),
                "Scale metric computed from partial data"
            );
        } else {
            debug!(
                policy = %self.policy,
                value,
                partitions = partitions.len(),
                "Scale metric computed"
            );
        }

        Ok((metric, lags))
    }
}

/// Prometheus integer gauges are signed.
pub(crate) fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
