//! Agent - one running consumer instance
//!
//! An Agent wires the lease manager, partition registry and per-partition consumers
//! together and owns their background tasks.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start()──▶ Started ──stop()──▶ Stopped
//! ```
//!
//! `start()` reconciles leases once, then spawns three tasks:
//!
//! - **registry loop**: reconciles leases with the partition set every `registry_refresh_interval`
//! - **lease loop**: runs `LeaseManager::acquire_or_renew` every `acquire_interval`
//! - **supervisor**: keeps exactly one consumer task per owned partition, bound to the
//!   claim the partition is held under
//!
//! `stop()` stops accepting batches, lets in-flight batches finish (up to
//! `shutdown_grace`), writes final checkpoints and releases leases. Releasing is only an
//! optimization: a crashed agent's leases expire on their own.
//!
//! ## Example
//!
//! ```ignore
//! let agent = Agent::builder()
//!     .change_feed(feed)
//!     .lease_store(store)
//!     .processor(Arc::new(OrderProcessor))
//!     .build()
//!     .await?;
//!
//! agent.start().await?;
//! tokio::signal::ctrl_c().await?;
//! agent.stop().await?;
//! ```

use crate::consumer::{ConsumerConfig, ConsumerExit, FeedConsumer};
use crate::error::{AgentError, Result};
use crate::lease_manager::{ClaimId, LeaseConfig, LeaseManager, OwnedLeases};
use crate::partition_registry::PartitionRegistry;
use crate::processor::BatchProcessor;
use feedscale_core::ChangeFeed;
use feedscale_metadata::{Clock, LeaseStore, SystemClock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity written into lease `owner` fields. Defaults to `Instance-{hostname}`.
    pub instance_id: String,

    pub lease: LeaseConfig,

    pub consumer: ConsumerConfig,

    /// How often the partition set is reconciled with the lease store
    pub registry_refresh_interval: Duration,

    /// How long `stop()` waits for in-flight batches
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            lease: LeaseConfig::default(),
            consumer: ConsumerConfig::default(),
            registry_refresh_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    Created,
    Started,
    Stopped,
}

pub struct Agent {
    config: AgentConfig,
    feed: Arc<dyn ChangeFeed>,
    processor: Arc<dyn BatchProcessor>,
    lease_manager: Arc<LeaseManager>,
    registry: Arc<PartitionRegistry>,
    state: Arc<RwLock<AgentState>>,
    shutdown_tx: watch::Sender<bool>,
    fatal_tx: Arc<watch::Sender<Option<String>>>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state == AgentState::Started {
            return Err(AgentError::AlreadyStarted);
        }

        info!(
            instance_id = %self.config.instance_id,
            lease_duration_ms = self.config.lease.lease_duration.as_millis() as u64,
            max_batch_size = self.config.consumer.max_batch_size,
            start_from = %self.config.consumer.start_from,
            "Starting feedscale agent"
        );

        self.shutdown_tx.send_replace(false);

        // Configuration problems surface here rather than in a background loop
        match self.registry.reconcile().await {
            Ok(report) => info!(
                instance_id = %self.config.instance_id,
                created = report.created.len(),
                revived = report.revived.len(),
                retired = report.retired.len(),
                "Initial lease reconcile complete"
            ),
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => warn!(
                instance_id = %self.config.instance_id,
                error = %e,
                "Initial lease reconcile failed, registry loop will retry"
            ),
        }

        let mut tasks = self.tasks.lock().await;

        let registry = Arc::clone(&self.registry);
        let interval = self.config.registry_refresh_interval;
        let shutdown = self.shutdown_tx.subscribe();
        let fatal = Arc::clone(&self.fatal_tx);
        tasks.push((
            "registry",
            tokio::spawn(async move {
                if let Err(e) = registry.run(interval, shutdown).await {
                    report_fatal(&fatal, e.to_string());
                }
            }),
        ));

        let manager = Arc::clone(&self.lease_manager);
        let shutdown = self.shutdown_tx.subscribe();
        let fatal = Arc::clone(&self.fatal_tx);
        tasks.push((
            "lease",
            tokio::spawn(async move {
                if let Err(e) = manager.run(shutdown).await {
                    report_fatal(&fatal, e.to_string());
                }
            }),
        ));

        let supervisor = ConsumerSupervisor {
            feed: Arc::clone(&self.feed),
            leases: Arc::clone(&self.lease_manager),
            processor: Arc::clone(&self.processor),
            config: self.config.consumer.clone(),
            grace: self.config.shutdown_grace,
            sweep_interval: self.config.lease.acquire_interval,
            fatal: Arc::clone(&self.fatal_tx),
            running: HashMap::new(),
            gone: HashSet::new(),
        };
        let owned = self.lease_manager.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push((
            "supervisor",
            tokio::spawn(supervisor.run(owned, shutdown)),
        ));

        *state = AgentState::Started;

        info!(
            instance_id = %self.config.instance_id,
            "Agent started successfully"
        );

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state != AgentState::Started {
            warn!(
                instance_id = %self.config.instance_id,
                "Agent not started, skipping stop"
            );
            return Ok(());
        }

        info!(
            instance_id = %self.config.instance_id,
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Stopping agent gracefully"
        );

        self.shutdown_tx.send_replace(true);

        // The supervisor enforces the grace period on consumers before returning
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(
                    instance_id = %self.config.instance_id,
                    task = name,
                    error = %e,
                    "Agent task ended abnormally"
                );
            }
        }

        self.lease_manager.release_all().await;

        *state = AgentState::Stopped;

        info!(
            instance_id = %self.config.instance_id,
            "Agent stopped successfully"
        );

        Ok(())
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn is_started(&self) -> bool {
        *self.state.read().await == AgentState::Started
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.lease_manager
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    pub async fn owned_partitions(&self) -> BTreeSet<String> {
        self.lease_manager.owned_partitions().await
    }

    /// First configuration-class error seen by any background task.
    pub fn fatal(&self) -> Option<String> {
        self.fatal_tx.borrow().clone()
    }

    /// Wait on this to learn about configuration-class errors as they happen.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }
}

fn report_fatal(fatal: &watch::Sender<Option<String>>, message: String) {
    error!(error = %message, "Agent hit a configuration error");
    fatal.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(message);
            true
        } else {
            false
        }
    });
}

struct RunningConsumer {
    claim: ClaimId,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<ConsumerExit>,
}

/// Keeps one consumer task per owned partition.
struct ConsumerSupervisor {
    feed: Arc<dyn ChangeFeed>,
    leases: Arc<LeaseManager>,
    processor: Arc<dyn BatchProcessor>,
    config: ConsumerConfig,
    grace: Duration,
    sweep_interval: Duration,
    fatal: Arc<watch::Sender<Option<String>>>,
    running: HashMap<String, RunningConsumer>,
    /// Partitions whose consumer found them missing from the log; not restarted
    /// until the registry retires the lease and ownership drops.
    gone: HashSet<String>,
}

impl ConsumerSupervisor {
    async fn run(
        mut self,
        mut owned_rx: watch::Receiver<OwnedLeases>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.sweep_interval);

        loop {
            let owned = owned_rx.borrow_and_update().clone();
            self.reap().await;
            self.sync(&owned);

            tokio::select! {
                _ = shutdown.changed() => break,
                changed = owned_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }
        }

        self.drain().await;
    }

    /// Collect consumers that have exited on their own.
    async fn reap(&mut self) {
        let finished: Vec<String> = self
            .running
            .iter()
            .filter(|(_, c)| c.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for partition_id in finished {
            let Some(consumer) = self.running.remove(&partition_id) else {
                continue;
            };
            match consumer.handle.await {
                Ok(ConsumerExit::Fatal(message)) => report_fatal(&self.fatal, message),
                Ok(ConsumerExit::PartitionGone) => {
                    self.gone.insert(partition_id);
                }
                Ok(exit) => {
                    debug!(partition_id = %partition_id, exit = ?exit, "Consumer finished");
                }
                Err(e) => {
                    warn!(partition_id = %partition_id, error = %e, "Consumer task panicked");
                }
            }
        }
    }

    /// Start consumers for newly owned partitions and stop the ones whose claim is gone.
    ///
    /// A partition lost and claimed again within one lease cycle keeps its id but gets a
    /// new claim; its old consumer is stopped and a new one starts once the old one has
    /// been reaped.
    fn sync(&mut self, owned: &OwnedLeases) {
        self.gone.retain(|p| owned.contains_key(p));

        for (partition_id, consumer) in &self.running {
            if owned.get(partition_id) != Some(&consumer.claim) {
                debug!(
                    partition_id = %partition_id,
                    claim = consumer.claim,
                    "Claim no longer held, stopping consumer"
                );
                let _ = consumer.stop_tx.send(true);
            }
        }

        for (partition_id, &claim) in owned {
            if self.running.contains_key(partition_id) || self.gone.contains(partition_id) {
                continue;
            }

            let (stop_tx, stop_rx) = watch::channel(false);
            let consumer = FeedConsumer::new(
                partition_id.clone(),
                Arc::clone(&self.feed),
                Arc::clone(&self.leases),
                Arc::clone(&self.processor),
                self.config.clone(),
            )
            .for_claim(claim);
            let handle = tokio::spawn(consumer.run(stop_rx));

            self.running.insert(
                partition_id.clone(),
                RunningConsumer {
                    claim,
                    stop_tx,
                    handle,
                },
            );
        }
    }

    /// Stop every consumer, waiting at most `grace` for in-flight batches.
    async fn drain(&mut self) {
        for consumer in self.running.values() {
            let _ = consumer.stop_tx.send(true);
        }

        let deadline = tokio::time::Instant::now() + self.grace;

        for (partition_id, mut consumer) in self.running.drain() {
            match tokio::time::timeout_at(deadline, &mut consumer.handle).await {
                Ok(Ok(ConsumerExit::Fatal(message))) => report_fatal(&self.fatal, message),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(partition_id = %partition_id, error = %e, "Consumer task panicked");
                }
                Err(_) => {
                    warn!(
                        partition_id = %partition_id,
                        "Consumer did not finish within grace period, aborting"
                    );
                    consumer.handle.abort();
                }
            }
        }
    }
}

pub struct AgentBuilder {
    config: AgentConfig,
    feed: Option<Arc<dyn ChangeFeed>>,
    store: Option<Arc<dyn LeaseStore>>,
    processor: Option<Arc<dyn BatchProcessor>>,
    clock: Arc<dyn Clock>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            feed: None,
            store: None,
            processor: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.config.instance_id = instance_id.into();
        self
    }

    pub fn change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn BatchProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn lease_config(mut self, lease: LeaseConfig) -> Self {
        self.config.lease = lease;
        self
    }

    pub fn consumer_config(mut self, consumer: ConsumerConfig) -> Self {
        self.config.consumer = consumer;
        self
    }

    pub fn registry_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.registry_refresh_interval = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub async fn build(mut self) -> Result<Agent> {
        let feed = self
            .feed
            .ok_or_else(|| AgentError::Config("change_feed is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| AgentError::Config("lease_store is required".to_string()))?;
        let processor = self
            .processor
            .ok_or_else(|| AgentError::Config("processor is required".to_string()))?;

        if self.config.lease.acquire_interval >= self.config.lease.lease_duration {
            return Err(AgentError::Config(format!(
                "acquire_interval ({:?}) must be shorter than lease_duration ({:?})",
                self.config.lease.acquire_interval, self.config.lease.lease_duration
            )));
        }
        if self.config.consumer.max_batch_size == 0 {
            return Err(AgentError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }

        if self.config.instance_id.is_empty() {
            self.config.instance_id = default_instance_id();
        }

        let lease_manager = Arc::new(LeaseManager::new(
            self.config.instance_id.clone(),
            Arc::clone(&store),
            self.clock,
            self.config.lease.clone(),
        ));

        let registry = Arc::new(PartitionRegistry::new(
            Arc::clone(&feed),
            store,
            self.config.lease.retry.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(None);

        Ok(Agent {
            config: self.config,
            feed,
            processor,
            lease_manager,
            registry,
            state: Arc::new(RwLock::new(AgentState::Created)),
            shutdown_tx,
            fatal_tx: Arc::new(fatal_tx),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `Instance-{hostname}`, or a random suffix when the hostname is unavailable.
pub fn default_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| format!("Instance-{}", s)))
        .unwrap_or_else(|| format!("Instance-{}", uuid::Uuid::new_v4()))
}
