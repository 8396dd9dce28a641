//! Lifecycle orchestrator — drives cluster state transitions.
//!
//! ```text
//! create:  PENDING → CREATE_IN_PROGRESS → ACTIVE | CREATE_FAILED
//! update:  ACTIVE | UPDATE_FAILED → UPDATE_IN_PROGRESS → ACTIVE | UPDATE_FAILED
//! delete:  ACTIVE | *_FAILED → DELETE_IN_PROGRESS → DELETED | DELETE_FAILED
//! ```
//!
//! Every mutating request is validated before any side effect, admitted
//! through the idempotency table, and runs under the cluster's lock. The
//! cluster record and the accepted request are persisted together before
//! the provider is touched, so `recover()` can resume a transition that a
//! crash interrupted. Only ACTIVE clusters are reconciled.
//!
//! Lifecycle requests take precedence over ticks: a request that finds a
//! tick in flight waits up to `lock_wait` for it instead of failing.
//!
//! The compute fleet of a cluster can be stopped and started without
//! touching the cluster's own status. A stopped fleet is drained on every
//! tick and launches nothing.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use fleet_core::{
    payload_digest, validate_cluster, EngineConfig, RawTopology, ResourceKey, Topology,
};
use fleetgrid_autoscale::{reconcile, BootWindow, CapacityStatus, DemandSignal};
use fleetgrid_provider::{
    capture, with_retry, CapacityBackoff, ErrorClass, FleetProvider, ProviderError, RetryPolicy,
};
use fleetgrid_state::*;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::executor::{PendingRollbacks, PlanExecutor, ResourceCapacity, TickReport};
use crate::idempotency::{admit, incarnation_for, settle, Admission};
use crate::locks::{ClusterGuard, ClusterLocks, Contention, Holder};

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub name: String,
    pub topology: RawTopology,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub name: String,
    pub topology: RawTopology,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub name: String,
    pub token: Option<String>,
    pub retain_logs: bool,
}

/// Payload hashed for DELETE idempotency.
#[derive(Serialize)]
struct DeletePayload {
    retain_logs: bool,
}

/// Detailed view of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterDescription {
    pub summary: ClusterSummary,
    pub topology: Topology,
    pub topology_digest: String,
    pub compute_fleet: ComputeFleetStatus,
    pub capacity: Vec<ResourceCapacity>,
}

/// Why a tick did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A lifecycle transition or another tick holds the cluster.
    Busy,
    NotActive(ClusterStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed(TickReport),
}

/// Owns every cluster's lifecycle and reconciliation.
#[derive(Clone)]
pub struct Orchestrator {
    state: StateStore,
    provider: Arc<dyn FleetProvider>,
    demand: Arc<dyn DemandSignal>,
    config: EngineConfig,
    locks: ClusterLocks,
    backoff: Arc<Mutex<CapacityBackoff>>,
    rollbacks: PendingRollbacks,
    /// Last reported capacity per cluster.
    capacity: Arc<RwLock<HashMap<String, BTreeMap<ResourceKey, CapacityStatus>>>>,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        provider: Arc<dyn FleetProvider>,
        demand: Arc<dyn DemandSignal>,
        config: EngineConfig,
    ) -> Self {
        let backoff = CapacityBackoff::from_config(&config.capacity_backoff);
        Self {
            state,
            provider,
            demand,
            config,
            locks: ClusterLocks::new(),
            backoff: Arc::new(Mutex::new(backoff)),
            rollbacks: PendingRollbacks::default(),
            capacity: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn provider_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.provider_retry, self.config.provider_timeout())
    }

    fn snapshot_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.snapshot_retry, self.config.provider_timeout())
    }

    fn executor(&self) -> PlanExecutor {
        PlanExecutor::new(
            Arc::clone(&self.provider),
            self.provider_policy(),
            Arc::clone(&self.backoff),
            Arc::clone(&self.rollbacks),
        )
    }

    /// Call the provider with deadline and bounded retries.
    async fn call<T, F, Fut>(&self, operation: &str, op: F) -> LifecycleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        with_retry(&self.provider_policy(), operation, op)
            .await
            .map_err(LifecycleError::provider)
    }

    /// Lock the cluster for a lifecycle transition.
    async fn lock(&self, name: &str) -> LifecycleResult<ClusterGuard> {
        self.locks
            .acquire_for_lifecycle(name, self.config.lock_wait())
            .await
            .map_err(|contention| match contention {
                Contention::Lifecycle => LifecycleError::Busy(name.to_string()),
                Contention::TickTimeout => LifecycleError::ReconcileInProgress(name.to_string()),
            })
    }

    /// Admission under the cluster lock. A replay found here means an
    /// identical request finished while this one waited.
    async fn lock_and_admit(
        &self,
        name: &str,
        token: Option<&str>,
        operation: LifecycleOperation,
        digest: &str,
    ) -> LifecycleResult<(ClusterGuard, Admission)> {
        let guard = self.lock(name).await?;
        let admission = admit(&self.state, name, token, operation, digest, epoch_secs())?;
        Ok((guard, admission))
    }

    // ── Create ─────────────────────────────────────────────────────

    pub async fn create(&self, request: CreateRequest) -> LifecycleResult<ClusterSummary> {
        let topology = validate_cluster(&request.name, &request.topology)?;
        let op = LifecycleOperation::Create;
        let digest = payload_digest(op.as_str(), &topology)?;
        let name = request.name.as_str();

        if let Admission::Replay(summary) =
            admit(&self.state, name, request.token.as_deref(), op, &digest, epoch_secs())?
        {
            return Ok(summary);
        }
        let (_guard, admission) = self
            .lock_and_admit(name, request.token.as_deref(), op, &digest)
            .await?;
        let accepted = match admission {
            Admission::Replay(summary) => return Ok(summary),
            Admission::Fresh(accepted) => accepted,
        };

        let previous = self.state.get_cluster(name)?;
        if let Some(existing) = &previous {
            match existing.status {
                ClusterStatus::Deleted => {}
                ClusterStatus::DeleteInProgress => {
                    return Err(LifecycleError::InvalidState {
                        cluster: name.to_string(),
                        operation: op,
                        status: existing.status,
                    });
                }
                _ => return Err(LifecycleError::AlreadyExists(name.to_string())),
            }
        }

        let now = epoch_secs();
        let mut record = ClusterRecord {
            name: name.to_string(),
            status: ClusterStatus::Pending,
            status_reason: None,
            topology,
            pending_topology: None,
            last_token: request.token.clone(),
            retain_logs: true,
            created_at: now,
            updated_at: now,
            compute_fleet: ComputeFleetStatus::Running,
            incarnation: incarnation_for(previous.as_ref(), op),
        };
        self.state.record_transition(&record, accepted.as_ref())?;
        info!(cluster = %name, "cluster create accepted");

        self.run_create(&mut record, accepted).await
    }

    async fn run_create(
        &self,
        record: &mut ClusterRecord,
        accepted: Option<IdempotencyRecord>,
    ) -> LifecycleResult<ClusterSummary> {
        self.set_status(record, ClusterStatus::CreateInProgress)?;

        let name = record.name.clone();
        let topology = record.topology.clone();
        match self
            .call("provision", || self.provider.provision(&name, &topology))
            .await
        {
            Ok(()) => {
                self.set_status(record, ClusterStatus::Active)?;
                info!(cluster = %name, "cluster active");
                self.succeed(record, accepted)
            }
            Err(e) => self.fail(record, accepted, ClusterStatus::CreateFailed, e),
        }
    }

    // ── Update ─────────────────────────────────────────────────────

    pub async fn update(&self, request: UpdateRequest) -> LifecycleResult<ClusterSummary> {
        let topology = validate_cluster(&request.name, &request.topology)?;
        let op = LifecycleOperation::Update;
        let digest = payload_digest(op.as_str(), &topology)?;
        let name = request.name.as_str();

        if let Admission::Replay(summary) =
            admit(&self.state, name, request.token.as_deref(), op, &digest, epoch_secs())?
        {
            return Ok(summary);
        }
        let (_guard, admission) = self
            .lock_and_admit(name, request.token.as_deref(), op, &digest)
            .await?;
        let accepted = match admission {
            Admission::Replay(summary) => return Ok(summary),
            Admission::Fresh(accepted) => accepted,
        };

        let mut record = match self.state.get_cluster(name)? {
            Some(r) if r.status != ClusterStatus::Deleted => r,
            _ => return Err(LifecycleError::NotFound(name.to_string())),
        };
        if !matches!(record.status, ClusterStatus::Active | ClusterStatus::UpdateFailed) {
            return Err(LifecycleError::InvalidState {
                cluster: name.to_string(),
                operation: op,
                status: record.status,
            });
        }

        record.status = ClusterStatus::UpdateInProgress;
        record.status_reason = None;
        record.pending_topology = Some(topology.clone());
        record.last_token = request.token.clone();
        record.updated_at = epoch_secs();
        self.state.record_transition(&record, accepted.as_ref())?;
        info!(cluster = %name, "cluster update accepted");

        self.run_update(&mut record, topology, accepted).await
    }

    async fn run_update(
        &self,
        record: &mut ClusterRecord,
        topology: Topology,
        accepted: Option<IdempotencyRecord>,
    ) -> LifecycleResult<ClusterSummary> {
        let name = record.name.clone();
        match self
            .call("update_infrastructure", || {
                self.provider.update_infrastructure(&name, &topology)
            })
            .await
        {
            Ok(()) => {
                record.topology = topology;
                record.pending_topology = None;
                self.set_status(record, ClusterStatus::Active)?;
                info!(cluster = %name, "cluster updated");
                self.sweep_orphans(record).await;
                self.succeed(record, accepted)
            }
            Err(e) => {
                // Keep running on the last-known-good topology.
                record.pending_topology = None;
                self.fail(record, accepted, ClusterStatus::UpdateFailed, e)
            }
        }
    }

    /// Terminate instances that the new topology no longer has room for.
    /// Anything missed here is picked up by the next tick.
    async fn sweep_orphans(&self, record: &ClusterRecord) {
        let snapshot = match capture(
            self.provider.as_ref(),
            &record.name,
            &record.topology,
            &self.snapshot_policy(),
        )
        .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(cluster = %record.name, error = %e, "orphan sweep skipped");
                return;
            }
        };

        let orphans: Vec<_> = snapshot
            .resources
            .values()
            .flatten()
            .chain(snapshot.orphans.iter())
            .filter(|i| i.is_orphaned())
            .map(|i| i.id.clone())
            .collect();
        if orphans.is_empty() {
            return;
        }
        match self.executor().terminate(&orphans).await {
            Ok(()) => info!(cluster = %record.name, count = orphans.len(), "terminated orphaned instances"),
            Err(e) => warn!(cluster = %record.name, error = %e, "orphan sweep failed"),
        }
    }

    // ── Delete ─────────────────────────────────────────────────────

    pub async fn delete(&self, request: DeleteRequest) -> LifecycleResult<ClusterSummary> {
        let op = LifecycleOperation::Delete;
        let digest = payload_digest(
            op.as_str(),
            &DeletePayload {
                retain_logs: request.retain_logs,
            },
        )?;
        let name = request.name.as_str();

        if let Admission::Replay(summary) =
            admit(&self.state, name, request.token.as_deref(), op, &digest, epoch_secs())?
        {
            return Ok(summary);
        }
        let (guard, admission) = self
            .lock_and_admit(name, request.token.as_deref(), op, &digest)
            .await?;
        let accepted = match admission {
            Admission::Replay(summary) => return Ok(summary),
            Admission::Fresh(accepted) => accepted,
        };

        let mut record = self
            .state
            .get_cluster(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        match record.status {
            ClusterStatus::Deleted => {
                debug!(cluster = %name, "cluster already deleted");
                return self.succeed(&record, accepted);
            }
            ClusterStatus::Active | ClusterStatus::DeleteInProgress => {}
            status if status.is_failed() => {}
            status => {
                return Err(LifecycleError::InvalidState {
                    cluster: name.to_string(),
                    operation: op,
                    status,
                });
            }
        }

        record.status = ClusterStatus::DeleteInProgress;
        record.status_reason = None;
        record.pending_topology = None;
        record.retain_logs = request.retain_logs;
        record.last_token = request.token.clone();
        record.updated_at = epoch_secs();
        self.state.record_transition(&record, accepted.as_ref())?;
        info!(cluster = %name, retain_logs = request.retain_logs, "cluster delete accepted");

        let result = self.run_delete(&mut record, accepted).await;
        drop(guard);
        if record.status == ClusterStatus::Deleted {
            self.locks.prune(name).await;
        }
        result
    }

    async fn run_delete(
        &self,
        record: &mut ClusterRecord,
        accepted: Option<IdempotencyRecord>,
    ) -> LifecycleResult<ClusterSummary> {
        match self.drain(&record.name, record.retain_logs).await {
            Ok(()) => {
                self.set_status(record, ClusterStatus::Deleted)?;
                self.backoff
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear_cluster(&record.name);
                self.executor().forget_rollbacks(&record.name);
                self.capacity.write().await.remove(&record.name);
                info!(cluster = %record.name, "cluster deleted");
                self.succeed(record, accepted)
            }
            Err(e) => self.fail(record, accepted, ClusterStatus::DeleteFailed, e),
        }
    }

    /// Terminate everything tagged with the cluster and tear down its
    /// infrastructure until the provider confirms nothing is left.
    async fn drain(&self, name: &str, retain_logs: bool) -> LifecycleResult<()> {
        let attempts = self.config.delete_verify_attempts.max(1);
        let policy = self.provider_policy();
        let executor = self.executor();
        let provider = &self.provider;
        let mut attempt = 0;

        loop {
            let instances = self
                .call("list_instances", || provider.list_instances(name))
                .await?;
            let exists = self
                .call("infrastructure_exists", || provider.infrastructure_exists(name))
                .await?;
            if instances.is_empty() && !exists {
                return Ok(());
            }
            if attempt == attempts {
                return Err(LifecycleError::DeleteIncomplete {
                    cluster: name.to_string(),
                    reason: format!(
                        "{} instance(s) remain, infrastructure present: {exists}",
                        instances.len()
                    ),
                });
            }
            attempt += 1;

            if !instances.is_empty() {
                let ids: Vec<_> = instances.into_iter().map(|r| r.id).collect();
                debug!(cluster = %name, count = ids.len(), attempt, "terminating cluster instances");
                executor.terminate(&ids).await?;
            }
            if exists {
                match self
                    .call("teardown", || provider.teardown(name, retain_logs))
                    .await
                {
                    Ok(()) => {}
                    Err(LifecycleError::Provider { error, .. }) if error.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }

    // ── Compute fleet ──────────────────────────────────────────────

    /// Stop the cluster's compute fleet and terminate its instances. The
    /// cluster stays ACTIVE; ticks launch nothing until the fleet starts.
    pub async fn stop_fleet(&self, name: &str) -> LifecycleResult<ComputeFleetStatus> {
        let (_guard, mut record) = self.lock_fleet(name, LifecycleOperation::StopFleet).await?;
        if record.compute_fleet == ComputeFleetStatus::Stopped {
            return Ok(record.compute_fleet);
        }
        self.set_fleet(&mut record, ComputeFleetStatus::StopRequested)?;
        self.drain_fleet(&mut record).await?;
        Ok(record.compute_fleet)
    }

    /// Let the compute fleet run again. The next tick brings it back to
    /// its desired capacity.
    pub async fn start_fleet(&self, name: &str) -> LifecycleResult<ComputeFleetStatus> {
        let (_guard, mut record) = self.lock_fleet(name, LifecycleOperation::StartFleet).await?;
        if matches!(
            record.compute_fleet,
            ComputeFleetStatus::Running | ComputeFleetStatus::StartRequested
        ) {
            return Ok(record.compute_fleet);
        }
        self.set_fleet(&mut record, ComputeFleetStatus::StartRequested)?;
        info!(cluster = %name, "compute fleet start requested");
        Ok(record.compute_fleet)
    }

    async fn lock_fleet(
        &self,
        name: &str,
        operation: LifecycleOperation,
    ) -> LifecycleResult<(ClusterGuard, ClusterRecord)> {
        let guard = self.lock(name).await?;
        let record = match self.state.get_cluster(name)? {
            Some(r) if r.status != ClusterStatus::Deleted => r,
            _ => return Err(LifecycleError::NotFound(name.to_string())),
        };
        if !matches!(record.status, ClusterStatus::Active | ClusterStatus::UpdateFailed) {
            return Err(LifecycleError::InvalidState {
                cluster: name.to_string(),
                operation,
                status: record.status,
            });
        }
        Ok((guard, record))
    }

    /// Terminate every compute instance of a stopping fleet and mark it
    /// STOPPED. On failure the fleet stays STOPPING for the next tick.
    async fn drain_fleet(&self, record: &mut ClusterRecord) -> LifecycleResult<TickReport> {
        let name = record.name.clone();
        if record.compute_fleet != ComputeFleetStatus::Stopped {
            self.set_fleet(record, ComputeFleetStatus::Stopping)?;
        }
        let mut report = TickReport {
            cluster: name.clone(),
            ..Default::default()
        };

        let provider = &self.provider;
        let instances = self
            .call("list_instances", || provider.list_instances(&name))
            .await?;
        if !instances.is_empty() {
            let ids: Vec<_> = instances.into_iter().map(|r| r.id).collect();
            self.executor().terminate(&ids).await?;
            report.terminated = ids.len() as u32;
            info!(cluster = %name, count = ids.len(), "drained compute fleet");
        }
        self.executor().forget_rollbacks(&name);

        if record.compute_fleet != ComputeFleetStatus::Stopped {
            self.set_fleet(record, ComputeFleetStatus::Stopped)?;
            info!(cluster = %name, "compute fleet stopped");
        }
        Ok(report)
    }

    fn set_fleet(&self, record: &mut ClusterRecord, status: ComputeFleetStatus) -> LifecycleResult<()> {
        debug!(cluster = %record.name, from = %record.compute_fleet, to = %status, "compute fleet transition");
        record.compute_fleet = status;
        record.updated_at = epoch_secs();
        self.state.put_cluster(record)?;
        Ok(())
    }

    // ── Shared transition helpers ──────────────────────────────────

    fn set_status(&self, record: &mut ClusterRecord, status: ClusterStatus) -> LifecycleResult<()> {
        debug!(cluster = %record.name, from = %record.status, to = %status, "cluster transition");
        record.status = status;
        record.status_reason = None;
        record.updated_at = epoch_secs();
        self.state.put_cluster(record)?;
        Ok(())
    }

    fn succeed(
        &self,
        record: &ClusterRecord,
        accepted: Option<IdempotencyRecord>,
    ) -> LifecycleResult<ClusterSummary> {
        let summary = record.summary();
        settle(
            &self.state,
            accepted,
            RecordedOutcome::Succeeded {
                summary: summary.clone(),
            },
        )?;
        Ok(summary)
    }

    fn fail(
        &self,
        record: &mut ClusterRecord,
        accepted: Option<IdempotencyRecord>,
        status: ClusterStatus,
        err: LifecycleError,
    ) -> LifecycleResult<ClusterSummary> {
        match err.error_class() {
            Some(ErrorClass::Fatal) => error!(cluster = %record.name, error = %err, "lifecycle operation aborted"),
            _ => warn!(cluster = %record.name, %status, error = %err, "lifecycle operation failed"),
        }
        record.status = status;
        record.status_reason = Some(err.to_string());
        record.updated_at = epoch_secs();
        self.state.put_cluster(record)?;
        settle(
            &self.state,
            accepted,
            RecordedOutcome::Failed {
                code: err.kind().as_str().to_string(),
                message: err.to_string(),
            },
        )?;
        Err(err)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn describe(&self, name: &str) -> LifecycleResult<ClusterDescription> {
        let record = self
            .state
            .get_cluster(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        let constrained = self
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .constrained(name);
        let reported = self.capacity.read().await.get(name).cloned().unwrap_or_default();

        let capacity = record
            .topology
            .resource_keys()
            .into_iter()
            .map(|key| {
                let status = if constrained.contains(&key) {
                    CapacityStatus::Degraded
                } else {
                    reported.get(&key).copied().unwrap_or_default()
                };
                ResourceCapacity { key, status }
            })
            .collect();

        Ok(ClusterDescription {
            summary: record.summary(),
            topology_digest: payload_digest("topology", &record.topology)?,
            compute_fleet: record.compute_fleet,
            topology: record.topology,
            capacity,
        })
    }

    /// List clusters in `status`. Without a filter, DELETED clusters are
    /// left out.
    pub fn list(&self, status: Option<ClusterStatus>) -> LifecycleResult<Vec<ClusterSummary>> {
        Ok(self
            .state
            .list_clusters()?
            .iter()
            .filter(|r| listed(r.status, status))
            .map(ClusterRecord::summary)
            .collect())
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Run one reconciliation tick for a cluster.
    ///
    /// A failure to capture the fleet snapshot or read demand aborts the
    /// tick without touching the fleet or the cluster's state. Rollbacks
    /// left over from earlier ticks are finished first.
    pub async fn tick(&self, name: &str) -> LifecycleResult<TickOutcome> {
        let Some(_guard) = self.locks.try_acquire(name, Holder::Tick).await else {
            debug!(cluster = %name, "tick skipped, cluster busy");
            return Ok(TickOutcome::Skipped(SkipReason::Busy));
        };

        let mut record = self
            .state
            .get_cluster(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if record.status != ClusterStatus::Active {
            return Ok(TickOutcome::Skipped(SkipReason::NotActive(record.status)));
        }

        if record.compute_fleet.is_stopping() {
            return self.drain_fleet(&mut record).await.map(TickOutcome::Completed);
        }
        if record.compute_fleet == ComputeFleetStatus::StartRequested {
            self.set_fleet(&mut record, ComputeFleetStatus::Running)?;
            info!(cluster = %name, "compute fleet running");
        }

        let executor = self.executor();
        let recovered = executor.finish_rollbacks(name).await?;

        let snapshot = capture(
            self.provider.as_ref(),
            name,
            &record.topology,
            &self.snapshot_policy(),
        )
        .await?;
        let demand = self
            .demand
            .demand(name, &record.topology)
            .await
            .map_err(LifecycleError::Demand)?;
        let throttled = self
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .throttled(name, Instant::now());

        let boot = BootWindow::new(epoch_secs(), self.config.pending_grace());

        let plan = reconcile(&record.topology, &snapshot, &demand, &throttled, boot);
        if plan.is_noop() {
            debug!(cluster = %name, "fleet in balance");
        }
        let mut report = executor.execute(&record.topology, &plan).await?;
        report.rolled_back += recovered;

        let statuses = report
            .capacity
            .iter()
            .map(|c| (c.key.clone(), c.status))
            .collect();
        self.capacity.write().await.insert(name.to_string(), statuses);

        Ok(TickOutcome::Completed(report))
    }

    /// Tick every ACTIVE cluster in parallel.
    pub async fn tick_all(&self) -> Vec<(String, LifecycleResult<TickOutcome>)> {
        let clusters = match self.list(Some(ClusterStatus::Active)) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to list clusters for reconciliation");
                return Vec::new();
            }
        };

        let mut set = JoinSet::new();
        for cluster in clusters {
            let orchestrator = self.clone();
            set.spawn(async move {
                let result = orchestrator.tick(&cluster.name).await;
                (cluster.name, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, result)) => {
                    log_tick(&name, &result);
                    results.push((name, result));
                }
                Err(e) => error!(error = %e, "reconciliation task panicked"),
            }
        }
        results
    }

    /// Reconcile on the configured cadence until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.tick_interval();
        info!(interval_secs = interval.as_secs(), "reconciliation loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick_all().await;
                }
                _ = shutdown.changed() => {
                    info!("reconciliation loop shutting down");
                    break;
                }
            }
        }
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Resume transitions interrupted by a restart.
    pub async fn recover(&self) -> LifecycleResult<Vec<ClusterSummary>> {
        let mut resumed = Vec::new();

        for mut record in self.state.list_clusters()? {
            if !(record.status == ClusterStatus::Pending || record.status.is_in_progress()) {
                continue;
            }
            let _guard = self.locks.acquire(&record.name, Holder::Lifecycle).await;
            let accepted = match &record.last_token {
                Some(token) => self
                    .state
                    .get_request(&record.name, token)?
                    .filter(|r| r.outcome.is_none()),
                None => None,
            };
            info!(cluster = %record.name, status = %record.status, "resuming interrupted transition");

            let result = match record.status {
                ClusterStatus::Pending | ClusterStatus::CreateInProgress => {
                    self.run_create(&mut record, accepted).await
                }
                ClusterStatus::UpdateInProgress => match record.pending_topology.clone() {
                    Some(topology) => self.run_update(&mut record, topology, accepted).await,
                    None => {
                        self.set_status(&mut record, ClusterStatus::Active)?;
                        self.succeed(&record, accepted)
                    }
                },
                _ => self.run_delete(&mut record, accepted).await,
            };
            if let Err(e) = result {
                warn!(cluster = %record.name, error = %e, "resumed transition failed");
            }
            resumed.push(record.summary());
        }

        Ok(resumed)
    }
}

fn log_tick(name: &str, result: &LifecycleResult<TickOutcome>) {
    match result {
        Ok(TickOutcome::Completed(report)) => {
            if !report.pending_rollback.is_empty() {
                warn!(
                    cluster = %name,
                    count = report.pending_rollback.len(),
                    "rolled-back instances still running"
                );
            }
            if report.launched + report.terminated + report.rolled_back > 0 {
                info!(
                    cluster = %name,
                    launched = report.launched,
                    terminated = report.terminated,
                    rolled_back = report.rolled_back,
                    "reconciliation tick applied"
                );
            }
        }
        Ok(TickOutcome::Skipped(reason)) => debug!(cluster = %name, ?reason, "tick skipped"),
        Err(e) if e.error_class() == Some(ErrorClass::Fatal) => {
            error!(cluster = %name, error = %e, "reconciliation tick aborted")
        }
        Err(e) => warn!(cluster = %name, error = %e, "reconciliation tick aborted"),
    }
}

fn listed(status: ClusterStatus, filter: Option<ClusterStatus>) -> bool {
    match filter {
        Some(wanted) => status == wanted,
        None => status != ClusterStatus::Deleted,
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
