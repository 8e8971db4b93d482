use lazy_static::lazy_static;
use prometheus::{
    core::Collector, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Records handed to the batch processor and acknowledged
    pub static ref RECORDS_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_records_processed_total", "Total records processed"),
        &["partition"]
    ).expect("metric can be created");

    /// Batches processed successfully
    pub static ref BATCHES_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_batches_processed_total", "Total batches processed"),
        &["partition"]
    ).expect("metric can be created");

    /// Batches the processor rejected (redelivered later)
    pub static ref PROCESSING_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_processing_failures_total", "Total failed batch deliveries"),
        &["partition"]
    ).expect("metric can be created");

    /// Time spent inside the batch processor
    pub static ref BATCH_PROCESSING_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("feedscale_batch_processing_seconds", "Batch processing time in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        &["partition"]
    ).expect("metric can be created");

    /// Committed checkpoints
    pub static ref CHECKPOINTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_checkpoints_total", "Total checkpoints committed"),
        &["partition"]
    ).expect("metric can be created");

    /// Checkpoints refused because another instance took the lease
    pub static ref CHECKPOINT_CONFLICTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_checkpoint_conflicts_total", "Total checkpoint conflicts"),
        &["partition"]
    ).expect("metric can be created");

    // ============================================================================
    // Lease Metrics
    // ============================================================================

    /// Leases claimed (fresh, expired or stolen)
    pub static ref LEASE_ACQUISITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_lease_acquisitions_total", "Total leases acquired"),
        &["instance"]
    ).expect("metric can be created");

    /// Leases lost to expiry or another instance
    pub static ref LEASE_LOSSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_lease_losses_total", "Total leases lost"),
        &["instance"]
    ).expect("metric can be created");

    /// Leases currently held
    pub static ref LEASES_OWNED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("feedscale_leases_owned", "Leases currently owned"),
        &["instance"]
    ).expect("metric can be created");

    /// Partitions currently in the change feed
    pub static ref PARTITIONS_TOTAL: IntGauge = IntGauge::new(
        "feedscale_partitions_total",
        "Partitions known to the registry"
    ).expect("metric can be created");

    // ============================================================================
    // Scaler Metrics
    // ============================================================================

    /// Last estimated lag per partition
    pub static ref PARTITION_LAG: IntGaugeVec = IntGaugeVec::new(
        Opts::new("feedscale_partition_lag", "Estimated unprocessed records per partition"),
        &["partition"]
    ).expect("metric can be created");

    /// Last reported scale metric
    pub static ref SCALE_METRIC: IntGaugeVec = IntGaugeVec::new(
        Opts::new("feedscale_scale_metric", "Last scale metric reported to the autoscaler"),
        &["policy"]
    ).expect("metric can be created");

    /// Lag estimates that fell back to zero
    pub static ref LAG_ESTIMATION_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedscale_lag_estimation_errors_total", "Total degraded lag estimates"),
        &["error_type"] // feed, lease_store
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn Collector>> = vec![
            // Consumer metrics
            Box::new(RECORDS_PROCESSED_TOTAL.clone()),
            Box::new(BATCHES_PROCESSED_TOTAL.clone()),
            Box::new(PROCESSING_FAILURES_TOTAL.clone()),
            Box::new(BATCH_PROCESSING_SECONDS.clone()),
            Box::new(CHECKPOINTS_TOTAL.clone()),
            Box::new(CHECKPOINT_CONFLICTS_TOTAL.clone()),
            // Lease metrics
            Box::new(LEASE_ACQUISITIONS_TOTAL.clone()),
            Box::new(LEASE_LOSSES_TOTAL.clone()),
            Box::new(LEASES_OWNED.clone()),
            Box::new(PARTITIONS_TOTAL.clone()),
            // Scaler metrics
            Box::new(PARTITION_LAG.clone()),
            Box::new(SCALE_METRIC.clone()),
            Box::new(LAG_ESTIMATION_ERRORS_TOTAL.clone()),
        ];

        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("feedscale metric can be registered");
        }
    });
}
