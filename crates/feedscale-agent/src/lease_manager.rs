//! Lease Manager - Partition Ownership Coordination
//!
//! Each running instance has one LeaseManager. It decides which partitions the instance
//! consumes, using nothing but versioned conditional writes against the lease store.
//!
//! ## How It Works
//!
//! Every `acquire_interval` the manager runs one cycle:
//!
//! 1. **List** all leases
//! 2. **Renew** every lease we hold (conditional write extending `expires_at`)
//! 3. **Adopt** leases a peer has handed over to us
//! 4. **Target**: `ceil(active leases / live owners)`, counting this instance and every
//!    instance waiting on a handoff as an owner
//! 5. **Release** leases above target
//! 6. **Claim** unowned or expired leases up to target
//! 7. **Request a handoff** from the most loaded peer above target when nothing is free
//!
//! A lost conditional write is never an error. It means another instance wrote the lease
//! since we read it, and we simply stop considering the partition ours.
//!
//! ## Handoff
//!
//! A live lease is never written over by another instance. The instance that wants it
//! marks it with a takeover request instead, which bumps the version. The owner's next
//! renewal or checkpoint on that lease conflicts, and the owner answers by writing the
//! lease to the requester, carrying its latest checkpoint along. Until then the owner
//! keeps consuming and the requester does not, so no partition ever has two owners.
//!
//! ## Claims
//!
//! Every successful claim gets a fresh [`ClaimId`]. Consumers capture it when they start
//! and checkpoint through it, so a consumer from an earlier claim can never write once
//! the lease was lost and claimed again, even by this same instance.
//!
//! ## Crash Safety
//!
//! Nobody deregisters. An instance that dies stops renewing, its leases pass
//! `expires_at`, and the next cycle of any other instance claims them.
//!
//! ## Example
//!
//! ```ignore
//! let manager = Arc::new(LeaseManager::new("Instance-a", store, clock, LeaseConfig::default()));
//!
//! let owned = manager.acquire_or_renew().await?;
//! for partition_id in &owned {
//!     // ... process a batch ...
//!     match manager.checkpoint(partition_id, batch.continuation).await? {
//!         CheckpointOutcome::Committed { .. } => {}
//!         CheckpointOutcome::Conflict => break, // ownership moved elsewhere
//!     }
//! }
//! ```

use crate::error::Result;
use crate::retry::{retry_with_backoff, RetryPolicy};
use feedscale_core::ContinuationToken;
use feedscale_metadata::{Clock, Lease, LeaseStore, WriteOutcome};
use feedscale_observability::metrics::{LEASES_OWNED, LEASE_ACQUISITIONS_TOTAL, LEASE_LOSSES_TOTAL};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Lease timing configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a claim lasts without renewal
    pub lease_duration: Duration,

    /// How often the acquire/renew cycle runs. Keep well below `lease_duration`.
    pub acquire_interval: Duration,

    /// Backoff for transient lease store failures
    pub retry: RetryPolicy,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            acquire_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Checkpoint durably written at `version`
    Committed { version: u64 },
    /// Ownership changed; the checkpoint was not written
    Conflict,
}

/// Identity of one claim on a lease. Unique per manager.
pub type ClaimId = u64;

/// Held partitions with the claim each one is held under.
pub type OwnedLeases = BTreeMap<String, ClaimId>;

#[derive(Clone)]
struct HeldLease {
    claim: ClaimId,
    /// The mutex serializes our own writes so renewals and checkpoints never race
    /// each other on the same version.
    lease: Arc<Mutex<Lease>>,
}

/// Manages the partition leases held by one instance.
pub struct LeaseManager {
    instance_id: String,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,

    /// Leases this instance believes it holds, with the last version it wrote
    leases: RwLock<HashMap<String, HeldLease>>,

    next_claim: AtomicU64,

    owned_tx: watch::Sender<OwnedLeases>,
}

impl LeaseManager {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
    ) -> Self {
        let (owned_tx, _) = watch::channel(OwnedLeases::new());
        Self {
            instance_id: instance_id.into(),
            store,
            clock,
            config,
            leases: RwLock::new(HashMap::new()),
            next_claim: AtomicU64::new(1),
            owned_tx,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Receive the held partitions and their claims whenever either changes.
    pub fn subscribe(&self) -> watch::Receiver<OwnedLeases> {
        self.owned_tx.subscribe()
    }

    /// Run one acquire/renew/balance cycle and return the partitions owned afterwards.
    pub async fn acquire_or_renew(&self) -> Result<BTreeSet<String>> {
        let snapshot = retry_with_backoff(&self.config.retry, "list_leases", || self.store.list())
            .await?;
        let now = self.clock.now_ms();

        // Renew first so the owner census below reflects what we actually still hold
        self.renew_all().await?;

        let active: Vec<&Lease> = snapshot.iter().filter(|l| l.is_active()).collect();

        self.adopt(&active, now).await?;
        let owned_now = self.owned_partitions().await;

        // Instances waiting on a handoff count as owners, so the share they are about to
        // receive is not claimed back in the meantime.
        let mut owners: HashSet<&str> = HashSet::from([self.instance_id.as_str()]);
        let mut peer_load: HashMap<String, usize> = HashMap::new();
        let mut incoming = 0;
        for lease in &active {
            let Some(owner) = lease.live_owner(now) else {
                continue;
            };
            owners.insert(owner);
            match lease.pending_takeover(now) {
                Some(requester) => {
                    owners.insert(requester);
                    if requester == self.instance_id && owner != self.instance_id {
                        incoming += 1;
                    }
                }
                None if owner != self.instance_id => {
                    *peer_load.entry(owner.to_string()).or_default() += 1;
                }
                None => {}
            }
        }

        let target = active.len().div_ceil(owners.len());

        debug!(
            instance_id = %self.instance_id,
            active_leases = active.len(),
            live_owners = owners.len(),
            owned = owned_now.len(),
            incoming,
            target,
            "Lease cycle census"
        );

        let mut owned_count = owned_now.len();

        // Overloaded relative to peers: hand back the excess
        if owned_count > target {
            let excess: Vec<String> = owned_now
                .iter()
                .rev()
                .take(owned_count - target)
                .cloned()
                .collect();
            for partition_id in excess {
                if let Err(e) = self.release(&partition_id).await {
                    warn!(
                        instance_id = %self.instance_id,
                        partition_id = %partition_id,
                        error = %e,
                        "Failed to release excess lease"
                    );
                }
                owned_count -= 1;
            }
        }

        // Handoffs already requested count towards the target
        let mut committed = owned_count + incoming;

        if committed < target {
            let cached = self.owned_partitions().await;
            for lease in &active {
                if committed >= target {
                    break;
                }
                if cached.contains(&lease.partition_id) || lease.live_owner(now).is_some() {
                    continue;
                }
                if self.try_claim(lease, false).await? {
                    committed += 1;
                }
            }
        }

        // Nothing free left: ask the most loaded peer to hand leases over while it stays
        // above target
        let mut tried: HashSet<&str> = HashSet::new();
        while committed < target {
            let victim = peer_load
                .iter()
                .filter(|(_, load)| **load > target)
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(owner, _)| owner.clone());

            let Some(victim) = victim else {
                break;
            };

            let candidate = active.iter().rev().find(|l| {
                l.live_owner(now) == Some(victim.as_str())
                    && l.takeover_by.is_none()
                    && !tried.contains(l.partition_id.as_str())
            });

            let Some(lease) = candidate else {
                peer_load.remove(&victim);
                continue;
            };

            tried.insert(lease.partition_id.as_str());
            if let Some(load) = peer_load.get_mut(&victim) {
                *load = load.saturating_sub(1);
            }
            if self.request_takeover(lease, &victim).await? {
                committed += 1;
            }
        }

        let owned = self.publish().await;
        Ok(owned)
    }

    /// Give up a partition. The checkpoint is kept for the next owner.
    pub async fn release(&self, partition_id: &str) -> Result<()> {
        let entry = self.leases.write().await.remove(partition_id);
        let Some(entry) = entry else {
            return Ok(());
        };

        let lease = entry.lease.lock().await;
        let outcome = retry_with_backoff(&self.config.retry, "release_lease", || {
            self.store.conditional_put(lease.released(), lease.version)
        })
        .await;
        self.publish().await;

        match outcome? {
            WriteOutcome::Written(_) => {
                info!(
                    instance_id = %self.instance_id,
                    partition_id = %partition_id,
                    "Released partition lease"
                );
            }
            WriteOutcome::Conflict { .. } => {
                // A peer may be waiting for exactly this lease
                if self.hand_over(&lease, None).await?.is_none() {
                    debug!(
                        instance_id = %self.instance_id,
                        partition_id = %partition_id,
                        "Lease already taken over, nothing to release"
                    );
                }
            }
        }

        Ok(())
    }

    /// Release every held lease, logging failures. Used on shutdown.
    pub async fn release_all(&self) {
        let partitions = self.owned_partitions().await;

        for partition_id in partitions {
            if let Err(e) = self.release(&partition_id).await {
                warn!(
                    instance_id = %self.instance_id,
                    partition_id = %partition_id,
                    error = %e,
                    "Failed to release lease during shutdown"
                );
            }
        }
    }

    /// Advance the checkpoint using the last version this instance wrote.
    pub async fn checkpoint(
        &self,
        partition_id: &str,
        token: ContinuationToken,
    ) -> Result<CheckpointOutcome> {
        let Some(held) = self.held(partition_id).await else {
            return Ok(CheckpointOutcome::Conflict);
        };
        self.write_checkpoint(partition_id, held, token, None).await
    }

    /// Advance the checkpoint only if the lease is still at `expected_version`.
    pub async fn checkpoint_with_version(
        &self,
        partition_id: &str,
        token: ContinuationToken,
        expected_version: u64,
    ) -> Result<CheckpointOutcome> {
        let Some(held) = self.held(partition_id).await else {
            return Ok(CheckpointOutcome::Conflict);
        };
        self.write_checkpoint(partition_id, held, token, Some(expected_version))
            .await
    }

    /// Advance the checkpoint only while the lease is still held under `claim`.
    ///
    /// A lease that was lost and claimed again has a new claim, so writes from the
    /// earlier claim conflict without disturbing the current one.
    pub async fn checkpoint_claim(
        &self,
        partition_id: &str,
        claim: ClaimId,
        token: ContinuationToken,
    ) -> Result<CheckpointOutcome> {
        match self.held(partition_id).await {
            Some(held) if held.claim == claim => {
                self.write_checkpoint(partition_id, held, token, None).await
            }
            _ => Ok(CheckpointOutcome::Conflict),
        }
    }

    async fn write_checkpoint(
        &self,
        partition_id: &str,
        held: HeldLease,
        token: ContinuationToken,
        expected_version: Option<u64>,
    ) -> Result<CheckpointOutcome> {
        let mut lease = held.lease.lock().await;
        let expected_version = expected_version.unwrap_or(lease.version);
        let now = self.clock.now_ms();

        if lease.version != expected_version || lease.is_expired(now) {
            drop(lease);
            self.lose(partition_id, held.claim).await;
            return Ok(CheckpointOutcome::Conflict);
        }

        let mut updated = lease.claimed_by(&self.instance_id, self.expiry_from(now));
        updated.checkpoint = Some(token.clone());

        let outcome = retry_with_backoff(&self.config.retry, "checkpoint", || {
            self.store.conditional_put(updated.clone(), expected_version)
        })
        .await?;

        match outcome {
            WriteOutcome::Written(written) => {
                let version = written.version;
                *lease = written;
                Ok(CheckpointOutcome::Committed { version })
            }
            WriteOutcome::Conflict { current_version } => {
                debug!(
                    instance_id = %self.instance_id,
                    partition_id = %partition_id,
                    expected_version,
                    ?current_version,
                    "Checkpoint conflict, ownership moved"
                );
                let handed = self.surrender(&lease, held.claim, Some(token.clone())).await;
                drop(lease);
                match handed {
                    Some(written) if written.checkpoint.as_ref() == Some(&token) => {
                        Ok(CheckpointOutcome::Committed {
                            version: written.version,
                        })
                    }
                    _ => Ok(CheckpointOutcome::Conflict),
                }
            }
        }
    }

    /// Whether this instance holds an unexpired lease on the partition.
    pub async fn owns(&self, partition_id: &str) -> bool {
        match self.held(partition_id).await {
            Some(held) => !held.lease.lock().await.is_expired(self.clock.now_ms()),
            None => false,
        }
    }

    /// Whether the partition is still held, unexpired, under `claim`.
    pub async fn holds(&self, partition_id: &str, claim: ClaimId) -> bool {
        match self.held(partition_id).await {
            Some(held) if held.claim == claim => {
                !held.lease.lock().await.is_expired(self.clock.now_ms())
            }
            _ => false,
        }
    }

    /// Snapshot of a held lease.
    pub async fn lease(&self, partition_id: &str) -> Option<Lease> {
        let held = self.held(partition_id).await?;
        let lease = held.lease.lock().await;
        Some(lease.clone())
    }

    /// The current claim on a held lease, with a snapshot of the lease.
    pub async fn current_claim(&self, partition_id: &str) -> Option<(ClaimId, Lease)> {
        let held = self.held(partition_id).await?;
        let lease = held.lease.lock().await;
        Some((held.claim, lease.clone()))
    }

    pub async fn owned_partitions(&self) -> BTreeSet<String> {
        self.leases.read().await.keys().cloned().collect()
    }

    /// Run the acquire/renew cycle every `acquire_interval` until `shutdown` flips.
    ///
    /// Transient failures are logged and retried on the next tick. A configuration error
    /// ends the loop and is returned.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.acquire_interval);

        info!(
            instance_id = %self.instance_id,
            interval_ms = self.config.acquire_interval.as_millis() as u64,
            lease_duration_ms = self.config.lease_duration.as_millis() as u64,
            "Lease cycle started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.acquire_or_renew().await {
                        if e.is_configuration() {
                            error!(
                                instance_id = %self.instance_id,
                                error = %e,
                                "Lease cycle failed with configuration error"
                            );
                            return Err(e);
                        }
                        warn!(
                            instance_id = %self.instance_id,
                            error = %e,
                            "Lease cycle failed, will retry next tick"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!(instance_id = %self.instance_id, "Lease cycle stopped");
                    return Ok(());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn expiry_from(&self, now: i64) -> i64 {
        now + self.config.lease_duration.as_millis() as i64
    }

    async fn held(&self, partition_id: &str) -> Option<HeldLease> {
        self.leases.read().await.get(partition_id).cloned()
    }

    async fn renew_all(&self) -> Result<()> {
        let entries: Vec<(String, HeldLease)> = self
            .leases
            .read()
            .await
            .iter()
            .map(|(id, held)| (id.clone(), held.clone()))
            .collect();

        for (partition_id, held) in entries {
            let mut lease = held.lease.lock().await;
            let now = self.clock.now_ms();

            // Missed the renewal deadline: another instance may already be consuming
            if lease.is_expired(now) {
                drop(lease);
                warn!(
                    instance_id = %self.instance_id,
                    partition_id = %partition_id,
                    "Lease expired before renewal"
                );
                self.lose(&partition_id, held.claim).await;
                continue;
            }

            let renewed = lease.claimed_by(&self.instance_id, self.expiry_from(now));
            let expected = lease.version;
            let outcome = retry_with_backoff(&self.config.retry, "renew_lease", || {
                self.store.conditional_put(renewed.clone(), expected)
            })
            .await;

            match outcome {
                Ok(WriteOutcome::Written(written)) => {
                    *lease = written;
                }
                Ok(WriteOutcome::Conflict { .. }) => {
                    if self.surrender(&lease, held.claim, None).await.is_none() {
                        info!(
                            instance_id = %self.instance_id,
                            partition_id = %partition_id,
                            "Lease taken over by another instance"
                        );
                    }
                }
                Err(e) if e.is_configuration() => return Err(e.into()),
                Err(e) => {
                    // Keep the lease; the next cycle retries before it expires
                    warn!(
                        instance_id = %self.instance_id,
                        partition_id = %partition_id,
                        error = %e,
                        "Failed to renew lease"
                    );
                }
            }
        }

        Ok(())
    }

    /// Take over leases the store already records as ours: handed over by a peer, or left
    /// by an earlier run with the same instance id.
    async fn adopt(&self, active: &[&Lease], now: i64) -> Result<()> {
        let cached = self.owned_partitions().await;
        for lease in active {
            if cached.contains(&lease.partition_id)
                || !lease.is_owned_by(&self.instance_id, now)
                || lease.takeover_by.is_some()
            {
                continue;
            }
            self.try_claim(lease, true).await?;
        }
        Ok(())
    }

    /// Conditionally claim `lease` as read in the snapshot. Returns whether we won.
    async fn try_claim(&self, lease: &Lease, adopting: bool) -> Result<bool> {
        let now = self.clock.now_ms();
        let claimed = lease.claimed_by(&self.instance_id, self.expiry_from(now));

        let outcome = retry_with_backoff(&self.config.retry, "claim_lease", || {
            self.store.conditional_put(claimed.clone(), lease.version)
        })
        .await?;

        match outcome {
            WriteOutcome::Written(written) => {
                let partition_id = written.partition_id.clone();
                let claim = self.next_claim.fetch_add(1, Ordering::Relaxed);
                self.leases.write().await.insert(
                    partition_id.clone(),
                    HeldLease {
                        claim,
                        lease: Arc::new(Mutex::new(written)),
                    },
                );
                LEASE_ACQUISITIONS_TOTAL
                    .with_label_values(&[self.instance_id.as_str()])
                    .inc();

                if adopting {
                    info!(
                        instance_id = %self.instance_id,
                        partition_id = %partition_id,
                        claim,
                        "Adopted lease handed over to this instance"
                    );
                } else {
                    info!(
                        instance_id = %self.instance_id,
                        partition_id = %partition_id,
                        previous_owner = ?lease.owner,
                        claim,
                        "Acquired partition lease"
                    );
                }
                Ok(true)
            }
            WriteOutcome::Conflict { .. } => {
                debug!(
                    instance_id = %self.instance_id,
                    partition_id = %lease.partition_id,
                    "Lost race for lease, skipping this cycle"
                );
                Ok(false)
            }
        }
    }

    /// Ask the live owner of `lease` to hand it over. Returns whether the request landed.
    async fn request_takeover(&self, lease: &Lease, owner: &str) -> Result<bool> {
        let request = lease.with_takeover_request(&self.instance_id);

        let outcome = retry_with_backoff(&self.config.retry, "request_takeover", || {
            self.store.conditional_put(request.clone(), lease.version)
        })
        .await?;

        match outcome {
            WriteOutcome::Written(_) => {
                info!(
                    instance_id = %self.instance_id,
                    partition_id = %lease.partition_id,
                    from = %owner,
                    "Requested lease handoff from overloaded instance"
                );
                Ok(true)
            }
            WriteOutcome::Conflict { .. } => {
                debug!(
                    instance_id = %self.instance_id,
                    partition_id = %lease.partition_id,
                    "Lease changed before handoff request, skipping this cycle"
                );
                Ok(false)
            }
        }
    }

    /// A write on a held lease was refused. The lease is no longer ours; if the refusal
    /// came from a takeover request, the lease goes to the requester first. Returns the
    /// handoff write, if one happened.
    async fn surrender(
        &self,
        held: &Lease,
        claim: ClaimId,
        checkpoint: Option<ContinuationToken>,
    ) -> Option<Lease> {
        let handed = match self.hand_over(held, checkpoint).await {
            Ok(handed) => handed,
            Err(e) => {
                warn!(
                    instance_id = %self.instance_id,
                    partition_id = %held.partition_id,
                    error = %e,
                    "Failed to hand lease over, it will expire instead"
                );
                None
            }
        };
        self.lose(&held.partition_id, claim).await;
        handed
    }

    /// Write the lease to the instance that requested it, if the store still shows it as
    /// ours with a pending request. `checkpoint` rides along when nobody else has moved
    /// the checkpoint since our last write.
    async fn hand_over(
        &self,
        held: &Lease,
        checkpoint: Option<ContinuationToken>,
    ) -> Result<Option<Lease>> {
        let stored = retry_with_backoff(&self.config.retry, "get_lease", || {
            self.store.get(&held.partition_id)
        })
        .await?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        let now = self.clock.now_ms();
        if !stored.is_owned_by(&self.instance_id, now) || stored.generation != held.generation {
            return Ok(None);
        }
        let Some(requester) = stored.pending_takeover(now) else {
            return Ok(None);
        };

        let mut handoff = stored.claimed_by(requester, self.expiry_from(now));
        if stored.checkpoint == held.checkpoint {
            if let Some(token) = checkpoint {
                handoff.checkpoint = Some(token);
            }
        }

        let outcome = retry_with_backoff(&self.config.retry, "hand_over_lease", || {
            self.store.conditional_put(handoff.clone(), stored.version)
        })
        .await?;

        match outcome {
            WriteOutcome::Written(written) => {
                info!(
                    instance_id = %self.instance_id,
                    partition_id = %held.partition_id,
                    to = %requester,
                    checkpoint = ?written.checkpoint,
                    "Handed lease over to requesting instance"
                );
                Ok(Some(written))
            }
            WriteOutcome::Conflict { .. } => Ok(None),
        }
    }

    /// Forget a lease, unless it has been claimed again since `claim`.
    async fn lose(&self, partition_id: &str, claim: ClaimId) {
        let removed = {
            let mut leases = self.leases.write().await;
            match leases.get(partition_id) {
                Some(held) if held.claim == claim => leases.remove(partition_id).is_some(),
                _ => false,
            }
        };
        if removed {
            LEASE_LOSSES_TOTAL
                .with_label_values(&[self.instance_id.as_str()])
                .inc();
            self.publish().await;
        }
    }

    async fn publish(&self) -> BTreeSet<String> {
        let owned: OwnedLeases = self
            .leases
            .read()
            .await
            .iter()
            .map(|(id, held)| (id.clone(), held.claim))
            .collect();
        LEASES_OWNED
            .with_label_values(&[self.instance_id.as_str()])
            .set(owned.len() as i64);
        self.owned_tx.send_if_modified(|current| {
            if *current != owned {
                *current = owned.clone();
                true
            } else {
                false
            }
        });
        owned.into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedscale_metadata::{LeaseStatus, ManualClock, MemoryLeaseStore};

    const T0: i64 = 1_700_000_000_000;

    async fn make_store(partitions: usize) -> Arc<MemoryLeaseStore> {
        let store = Arc::new(MemoryLeaseStore::new());
        for i in 0..partitions {
            store
                .conditional_put(Lease::new(i.to_string()), 0)
                .await
                .unwrap();
        }
        store
    }

    fn make_manager(
        id: &str,
        store: Arc<MemoryLeaseStore>,
        clock: Arc<ManualClock>,
    ) -> LeaseManager {
        let config = LeaseConfig {
            retry: RetryPolicy::no_retry(),
            ..LeaseConfig::default()
        };
        LeaseManager::new(id, store, clock, config)
    }

    // ---------------------------------------------------------------
    // acquisition
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_single_instance_takes_everything() {
        let store = make_store(4).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock);

        let owned = manager.acquire_or_renew().await.unwrap();
        assert_eq!(owned.len(), 4);

        for lease in store.list().await.unwrap() {
            assert_eq!(lease.owner.as_deref(), Some("a"));
            assert_eq!(lease.expires_at, T0 + 30_000);
        }
    }

    #[tokio::test]
    async fn test_renewal_extends_expiry() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock.clone());

        manager.acquire_or_renew().await.unwrap();
        clock.advance(Duration::from_secs(10));
        manager.acquire_or_renew().await.unwrap();

        let lease = store.get("0").await.unwrap().unwrap();
        assert_eq!(lease.expires_at, T0 + 40_000);
        assert!(manager.owns("0").await);
    }

    #[tokio::test]
    async fn test_retired_leases_are_ignored() {
        let store = make_store(2).await;
        let mut retired = store.get("1").await.unwrap().unwrap();
        retired.status = LeaseStatus::Retired;
        store.conditional_put(retired, 1).await.unwrap();

        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store, clock);

        let owned = manager.acquire_or_renew().await.unwrap();
        assert_eq!(owned, BTreeSet::from(["0".to_string()]));
    }

    #[tokio::test]
    async fn test_subscribe_sees_ownership_changes() {
        let store = make_store(2).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store, clock);
        let mut rx = manager.subscribe();

        manager.acquire_or_renew().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 2);

        manager.release("0").await.unwrap();
        assert!(rx.has_changed().unwrap());
        let owned: Vec<String> = rx.borrow_and_update().keys().cloned().collect();
        assert_eq!(owned, vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_reclaim_gets_new_claim_and_is_published() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store, clock.clone());
        let mut rx = manager.subscribe();

        manager.acquire_or_renew().await.unwrap();
        let first = rx.borrow_and_update()["0"];

        // Expired and claimed again inside a single cycle
        clock.advance(Duration::from_secs(31));
        manager.acquire_or_renew().await.unwrap();

        assert!(rx.has_changed().unwrap());
        let second = rx.borrow_and_update()["0"];
        assert_ne!(first, second);
        assert!(!manager.holds("0", first).await);
        assert!(manager.holds("0", second).await);
    }

    // ---------------------------------------------------------------
    // checkpoints
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_checkpoint_bumps_version() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock);
        manager.acquire_or_renew().await.unwrap();

        let outcome = manager.checkpoint("0", "5".into()).await.unwrap();
        let CheckpointOutcome::Committed { version } = outcome else {
            panic!("expected commit, got {:?}", outcome);
        };

        let lease = store.get("0").await.unwrap().unwrap();
        assert_eq!(lease.version, version);
        assert_eq!(lease.checkpoint, Some("5".into()));
    }

    #[tokio::test]
    async fn test_checkpoint_with_stale_version_conflicts() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock);
        manager.acquire_or_renew().await.unwrap();

        let version = manager.lease("0").await.unwrap().version;
        let outcome = manager
            .checkpoint_with_version("0", "5".into(), version - 1)
            .await
            .unwrap();
        assert_eq!(outcome, CheckpointOutcome::Conflict);
        assert!(!manager.owns("0").await);
        assert!(store.get("0").await.unwrap().unwrap().checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_after_takeover_conflicts() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let a = make_manager("a", store.clone(), clock.clone());
        a.acquire_or_renew().await.unwrap();

        // Someone else rewrites the lease behind a's back
        let current = store.get("0").await.unwrap().unwrap();
        store
            .conditional_put(current.claimed_by("b", T0 + 60_000), current.version)
            .await
            .unwrap();

        let outcome = a.checkpoint("0", "9".into()).await.unwrap();
        assert_eq!(outcome, CheckpointOutcome::Conflict);
        assert!(!a.owns("0").await);

        let lease = store.get("0").await.unwrap().unwrap();
        assert_eq!(lease.owner.as_deref(), Some("b"));
        assert!(lease.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_from_earlier_claim_conflicts() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock);
        manager.acquire_or_renew().await.unwrap();
        let (old_claim, _) = manager.current_claim("0").await.unwrap();

        manager.release("0").await.unwrap();
        manager.acquire_or_renew().await.unwrap();
        manager.checkpoint("0", "8".into()).await.unwrap();

        let outcome = manager
            .checkpoint_claim("0", old_claim, "4".into())
            .await
            .unwrap();
        assert_eq!(outcome, CheckpointOutcome::Conflict);

        // The current claim is untouched
        assert!(manager.owns("0").await);
        assert_eq!(
            store.get("0").await.unwrap().unwrap().checkpoint,
            Some("8".into())
        );
    }

    #[tokio::test]
    async fn test_checkpoint_on_locally_expired_lease_conflicts() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock.clone());
        manager.acquire_or_renew().await.unwrap();

        clock.advance(Duration::from_secs(31));
        assert!(!manager.owns("0").await);

        let outcome = manager.checkpoint("0", "3".into()).await.unwrap();
        assert_eq!(outcome, CheckpointOutcome::Conflict);
        assert!(store.get("0").await.unwrap().unwrap().checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_checkpoint() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock);
        manager.acquire_or_renew().await.unwrap();
        manager.checkpoint("0", "12".into()).await.unwrap();

        manager.release("0").await.unwrap();

        let lease = store.get("0").await.unwrap().unwrap();
        assert!(lease.owner.is_none());
        assert_eq!(lease.checkpoint, Some("12".into()));
        assert!(manager.owned_partitions().await.is_empty());
    }

    // ---------------------------------------------------------------
    // handoff
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_takeover_request_leaves_owner_in_place() {
        let store = make_store(2).await;
        let clock = Arc::new(ManualClock::new(T0));
        let a = make_manager("a", store.clone(), clock.clone());
        let b = make_manager("b", store.clone(), clock);
        a.acquire_or_renew().await.unwrap();

        assert!(b.acquire_or_renew().await.unwrap().is_empty());

        let requested = store.get("1").await.unwrap().unwrap();
        assert_eq!(requested.owner.as_deref(), Some("a"));
        assert_eq!(requested.takeover_by.as_deref(), Some("b"));
        assert!(a.owns("1").await);
        assert!(!b.owns("1").await);
    }

    #[tokio::test]
    async fn test_checkpoint_hands_requested_lease_over() {
        let store = make_store(2).await;
        let clock = Arc::new(ManualClock::new(T0));
        let a = make_manager("a", store.clone(), clock.clone());
        let b = make_manager("b", store.clone(), clock);
        a.acquire_or_renew().await.unwrap();
        b.acquire_or_renew().await.unwrap();

        // a's checkpoint lands together with the handoff
        let outcome = a.checkpoint("1", "5".into()).await.unwrap();
        assert!(matches!(outcome, CheckpointOutcome::Committed { .. }));
        assert!(!a.owns("1").await);

        let lease = store.get("1").await.unwrap().unwrap();
        assert_eq!(lease.owner.as_deref(), Some("b"));
        assert_eq!(lease.checkpoint, Some("5".into()));
        assert!(lease.takeover_by.is_none());

        assert_eq!(
            b.acquire_or_renew().await.unwrap(),
            BTreeSet::from(["1".to_string()])
        );
        assert_eq!(b.lease("1").await.unwrap().checkpoint, Some("5".into()));
    }

    #[tokio::test]
    async fn test_release_honours_pending_takeover() {
        let store = make_store(2).await;
        let clock = Arc::new(ManualClock::new(T0));
        let a = make_manager("a", store.clone(), clock.clone());
        let b = make_manager("b", store.clone(), clock);
        a.acquire_or_renew().await.unwrap();
        b.acquire_or_renew().await.unwrap();

        a.release("1").await.unwrap();

        let lease = store.get("1").await.unwrap().unwrap();
        assert_eq!(lease.owner.as_deref(), Some("b"));
        assert!(lease.takeover_by.is_none());
    }

    // ---------------------------------------------------------------
    // failure handling
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let store = make_store(2).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock);
        manager.acquire_or_renew().await.unwrap();

        store.set_unavailable(true);
        let err = manager.acquire_or_renew().await.unwrap_err();
        assert!(err.is_transient());
        // Still within the lease: ownership is kept
        assert_eq!(manager.owned_partitions().await.len(), 2);

        store.set_unavailable(false);
        assert_eq!(manager.acquire_or_renew().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missed_renewal_drops_lease() {
        let store = make_store(1).await;
        let clock = Arc::new(ManualClock::new(T0));
        let manager = make_manager("a", store.clone(), clock.clone());
        manager.acquire_or_renew().await.unwrap();

        clock.advance(Duration::from_secs(45));
        // Dropped as lost, then reclaimed because nobody else took it
        let owned = manager.acquire_or_renew().await.unwrap();
        assert_eq!(owned.len(), 1);
        let lease = store.get("0").await.unwrap().unwrap();
        assert_eq!(lease.expires_at, T0 + 75_000);
    }
}
