//! feedscale demo
//!
//! One process running the whole loop: an order generator appending to an in-memory
//! change feed, an agent consuming it with a deliberately slow processor, and the scale
//! metric service an autoscaler would poll.
//!
//! # Environment Variables
//!
//! - `FEEDSCALE_PARTITIONS`: Number of feed partitions (default: 4)
//! - `FEEDSCALE_GENERATOR_RATE`: Orders generated per second (default: 10, 0 disables)
//! - `FEEDSCALE_LEASE_DB`: SQLite path for leases (default: in-memory store)
//! - `FEEDSCALE_PROCESSOR_NAME`: Lease namespace in the SQLite store (default: orders)
//! - `FEEDSCALE_INSTANCE_ID`: Lease owner name (default: `Instance-{hostname}`)
//! - `FEEDSCALE_METRIC_ADDR`: Metric service address (default: 0.0.0.0:8080)
//! - `FEEDSCALE_POLICY`: `active_partitions` or `total_lag` (default: active_partitions)
//! - `FEEDSCALE_START_FROM`: `beginning` or `now` (default: beginning)
//! - `FEEDSCALE_MAX_BATCH`: Max records per batch (default: 1000)
//! - `FEEDSCALE_PROCESSING_DELAY_MS`: Simulated work per order (default: 200)
//! - `RUST_LOG`: Log filter (default: info)
//!
//! # Example
//!
//! ```bash
//! export FEEDSCALE_PARTITIONS=8
//! export FEEDSCALE_POLICY=total_lag
//! export FEEDSCALE_LEASE_DB=./data/leases.db
//! cargo run --bin feedscale-demo
//! curl localhost:8080/v1/metric
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use feedscale_agent::{
    Agent, BatchProcessor, ConsumerConfig, PartitionRegistry, ProcessingError, RetryPolicy,
};
use feedscale_core::{Batch, MemoryFeed, StartFrom};
use feedscale_metadata::{LeaseStore, MemoryLeaseStore, SqliteLeaseStore, SystemClock};
use feedscale_observability::{init_metrics, init_tracing};
use feedscale_scaler::{AggregationPolicy, LagEstimator, ScaleMetricAggregator, ScalerServer};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const ARTICLES: &[&str] = &[
    "Keyboard", "Monitor", "Chair", "Desk", "Headphones", "Webcam", "Lamp", "Notebook",
];
const FIRST_NAMES: &[&str] = &["Ada", "Grace", "Linus", "Barbara", "Ken", "Margaret"];
const LAST_NAMES: &[&str] = &["Lovelace", "Hopper", "Torvalds", "Liskov", "Thompson", "Hamilton"];

#[derive(Debug, Serialize, Deserialize)]
struct Customer {
    first_name: String,
    last_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: String,
    amount: u32,
    article: String,
    customer: Customer,
}

impl Order {
    /// Deterministic pseudo-random order derived from a sequence number.
    fn generate(seq: u64) -> Self {
        let pick = |items: &[&str], salt: u64| {
            let mixed = seq.wrapping_mul(2_654_435_761).wrapping_add(salt);
            items[(mixed % items.len() as u64) as usize].to_string()
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            amount: (seq % 10) as u32 + 1,
            article: pick(ARTICLES, 7),
            customer: Customer {
                first_name: pick(FIRST_NAMES, 13),
                last_name: pick(LAST_NAMES, 31),
            },
        }
    }
}

/// Logs every order and sleeps to fake the work.
struct OrderProcessor {
    delay: Duration,
}

#[async_trait]
impl BatchProcessor for OrderProcessor {
    async fn process(&self, batch: &Batch) -> Result<(), ProcessingError> {
        info!(
            partition_id = %batch.partition_id,
            "{} order(s) received",
            batch.len()
        );

        for record in &batch.records {
            let order: Order = serde_json::from_slice(&record.value).map_err(|e| {
                ProcessingError::new(format!("bad order at {}: {}", record.position, e))
            })?;

            info!(
                partition_id = %batch.partition_id,
                "Processing order {} - {} unit(s) of {} bought by {} {}",
                order.id,
                order.amount,
                order.article,
                order.customer.first_name,
                order.customer.last_name
            );
            tokio::time::sleep(self.delay).await;
            info!(partition_id = %batch.partition_id, "Order {} processed", order.id);
        }

        Ok(())
    }
}

struct DemoConfig {
    partitions: usize,
    generator_rate: u64,
    lease_db: Option<String>,
    processor_name: String,
    instance_id: Option<String>,
    metric_addr: SocketAddr,
    policy: AggregationPolicy,
    start_from: StartFrom,
    max_batch_size: usize,
    processing_delay: Duration,
}

impl DemoConfig {
    fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            partitions: parse_env("FEEDSCALE_PARTITIONS", 4)?,
            generator_rate: parse_env("FEEDSCALE_GENERATOR_RATE", 10)?,
            lease_db: std::env::var("FEEDSCALE_LEASE_DB").ok(),
            processor_name: std::env::var("FEEDSCALE_PROCESSOR_NAME")
                .unwrap_or_else(|_| "orders".to_string()),
            instance_id: std::env::var("FEEDSCALE_INSTANCE_ID").ok(),
            metric_addr: std::env::var("FEEDSCALE_METRIC_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
                .parse()?,
            policy: std::env::var("FEEDSCALE_POLICY")
                .map(|s| AggregationPolicy::from_str(&s))
                .unwrap_or(Ok(AggregationPolicy::default()))?,
            start_from: std::env::var("FEEDSCALE_START_FROM")
                .map(|s| StartFrom::from_str(&s))
                .unwrap_or(Ok(StartFrom::default()))?,
            max_batch_size: parse_env("FEEDSCALE_MAX_BATCH", 1000)?,
            processing_delay: Duration::from_millis(parse_env(
                "FEEDSCALE_PROCESSING_DELAY_MS",
                200,
            )?),
        })
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("{}={}: {}", name, raw, e).into()),
        Err(_) => Ok(default),
    }
}

/// Append `rate` orders per second, spread round-robin over the partitions.
async fn run_generator(
    feed: Arc<MemoryFeed>,
    partitions: usize,
    rate: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for _ in 0..rate {
                    let order = Order::generate(seq);
                    let partition_id = (seq % partitions as u64).to_string();
                    seq += 1;

                    let value = match serde_json::to_vec(&order) {
                        Ok(value) => Bytes::from(value),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode order");
                            continue;
                        }
                    };

                    info!(
                        partition_id = %partition_id,
                        "Creating order {} - {} unit(s) of {} for {} {}",
                        order.id,
                        order.amount,
                        order.article,
                        order.customer.first_name,
                        order.customer.last_name
                    );
                    if let Err(e) = feed
                        .append(&partition_id, Some(Bytes::from(order.article.clone())), value)
                        .await
                    {
                        warn!(partition_id = %partition_id, error = %e, "Failed to append order");
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");
    init_metrics();

    let config = DemoConfig::from_env()?;

    info!("feedscale demo starting");
    info!("  Partitions: {}", config.partitions);
    info!("  Generator rate: {}/s", config.generator_rate);
    info!("  Lease store: {}", config.lease_db.as_deref().unwrap_or("in-memory"));
    info!("  Policy: {}", config.policy);
    info!("  Start from: {}", config.start_from);
    info!("  Metric address: {}", config.metric_addr);

    let feed = Arc::new(MemoryFeed::with_partitions(
        (0..config.partitions).map(|i| i.to_string()),
    ));

    let store: Arc<dyn LeaseStore> = match &config.lease_db {
        Some(path) => Arc::new(SqliteLeaseStore::new(path, config.processor_name.clone()).await?),
        None => Arc::new(MemoryLeaseStore::new()),
    };

    let mut builder = Agent::builder()
        .change_feed(feed.clone())
        .lease_store(store.clone())
        .processor(Arc::new(OrderProcessor {
            delay: config.processing_delay,
        }))
        .consumer_config(ConsumerConfig {
            max_batch_size: config.max_batch_size,
            start_from: config.start_from,
            ..Default::default()
        });
    if let Some(instance_id) = &config.instance_id {
        builder = builder.instance_id(instance_id.clone());
    }
    let agent = builder.build().await?;
    agent.start().await?;
    info!(instance_id = %agent.instance_id(), "Agent started");

    let clock = Arc::new(SystemClock);
    let registry = Arc::new(PartitionRegistry::new(
        feed.clone(),
        store.clone(),
        RetryPolicy::default(),
    ));
    let estimator = LagEstimator::new(
        feed.clone(),
        store,
        clock.clone(),
        config.start_from,
        RetryPolicy::default(),
    );
    let aggregator = Arc::new(ScaleMetricAggregator::new(
        registry,
        estimator,
        config.policy,
        clock,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ScalerServer::new(config.metric_addr, aggregator);
    let server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start(server_shutdown).await {
            error!(error = %e, "Scale metric server failed");
        }
    });

    let generator_handle = if config.generator_rate > 0 {
        Some(tokio::spawn(run_generator(
            feed.clone(),
            config.partitions.max(1),
            config.generator_rate,
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    let mut fatal_rx = agent.subscribe_fatal();
    let fatal = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal, stopping");
            None
        }
        result = fatal_rx.wait_for(|f| f.is_some()) => {
            result.ok().and_then(|f| f.clone())
        }
    };

    shutdown_tx.send_replace(true);
    if let Some(handle) = generator_handle {
        let _ = handle.await;
    }
    if let Err(e) = agent.stop().await {
        error!(error = %e, "Error during shutdown");
    }
    let _ = server_handle.await;

    match fatal {
        Some(message) => {
            error!(error = %message, "Stopped after a configuration error");
            Err(message.into())
        }
        None => {
            info!("feedscale demo stopped");
            Ok(())
        }
    }
}
