//! Plan executor — applies a scaling plan to the fleet provider.
//!
//! Terminations go out first as one batched call. Launches for every
//! compute resource then run concurrently; each queue's all-or-nothing
//! decision waits until all of that queue's launches have reported.
//!
//! A rollback whose termination fails leaves its instances in a shared
//! ledger; the next tick terminates them before it plans anything.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use fleet_core::{InstanceId, ResourceKey, Topology};
use fleetgrid_autoscale::{
    resolve_queue_outcome, CapacityStatus, LaunchOutcome, QueueResolution, ScalingPlan,
};
use fleetgrid_provider::{
    classify, with_retry, CapacityBackoff, ErrorClass, FleetProvider, LaunchFailure, LaunchRequest,
    ProviderError, RetryPolicy,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, LifecycleResult};

/// Capacity status of one compute resource after a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceCapacity {
    pub key: ResourceKey,
    pub status: CapacityStatus,
}

/// A launch failure that did not abort the tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    pub key: ResourceKey,
    pub class: ErrorClass,
    pub message: String,
}

/// What a tick did to the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub cluster: String,
    /// Instances launched and kept.
    pub launched: u32,
    pub terminated: u32,
    /// Instances launched this tick and then rolled back, plus earlier
    /// rollbacks completed this tick.
    pub rolled_back: u32,
    /// Rolled-back instances the provider has not terminated yet.
    pub pending_rollback: Vec<InstanceId>,
    pub capacity: Vec<ResourceCapacity>,
    pub failures: Vec<ResourceFailure>,
}

impl TickReport {
    pub fn status_of(&self, key: &ResourceKey) -> Option<CapacityStatus> {
        self.capacity.iter().find(|c| &c.key == key).map(|c| c.status)
    }
}

/// Rolled-back instances still awaiting termination, per cluster.
pub type PendingRollbacks = Arc<Mutex<HashMap<String, BTreeSet<InstanceId>>>>;

/// Applies plans for one cluster.
pub struct PlanExecutor {
    provider: Arc<dyn FleetProvider>,
    policy: RetryPolicy,
    backoff: Arc<Mutex<CapacityBackoff>>,
    rollbacks: PendingRollbacks,
}

struct LaunchResult {
    queue: String,
    outcome: LaunchOutcome,
    error: Option<ProviderError>,
}

impl PlanExecutor {
    pub fn new(
        provider: Arc<dyn FleetProvider>,
        policy: RetryPolicy,
        backoff: Arc<Mutex<CapacityBackoff>>,
        rollbacks: PendingRollbacks,
    ) -> Self {
        Self {
            provider,
            policy,
            backoff,
            rollbacks,
        }
    }

    /// Instances of `cluster` whose rollback has not gone through yet.
    pub fn pending_rollback(&self, cluster: &str) -> Vec<InstanceId> {
        self.rollbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Terminate rollbacks left over from earlier ticks. Returns how many
    /// were cleared; on failure they stay pending.
    pub async fn finish_rollbacks(&self, cluster: &str) -> LifecycleResult<u32> {
        let pending = self.pending_rollback(cluster);
        if pending.is_empty() {
            return Ok(0);
        }
        self.terminate(&pending).await?;
        self.forget_rollbacks(cluster);
        info!(%cluster, count = pending.len(), "completed pending rollback");
        Ok(pending.len() as u32)
    }

    pub fn forget_rollbacks(&self, cluster: &str) {
        self.rollbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cluster);
    }

    fn defer_rollback(&self, cluster: &str, instances: &[InstanceId]) {
        self.rollbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cluster.to_string())
            .or_default()
            .extend(instances.iter().cloned());
    }

    pub async fn execute(&self, topology: &Topology, plan: &ScalingPlan) -> LifecycleResult<TickReport> {
        let cluster = plan.cluster.as_str();
        let mut report = TickReport {
            cluster: cluster.to_string(),
            ..Default::default()
        };

        let doomed: Vec<InstanceId> = plan.terminations().map(|t| t.instance.clone()).collect();
        if !doomed.is_empty() {
            self.terminate(&doomed).await?;
            report.terminated = doomed.len() as u32;
            info!(%cluster, count = doomed.len(), "terminated instances");
        }

        let mut by_queue = self.launch_all(cluster, topology, plan).await?;
        let mut constrained: Vec<ResourceKey> = Vec::new();
        let mut fatal = None;

        for queue in &plan.queues {
            let results = by_queue.remove(&queue.name).unwrap_or_default();
            let outcomes: Vec<LaunchOutcome> = results.iter().map(|r| r.outcome.clone()).collect();

            for result in results {
                let LaunchResult { outcome, error, .. } = result;
                {
                    let mut backoff = self.backoff.lock().unwrap_or_else(PoisonError::into_inner);
                    if outcome.is_capacity_constrained() {
                        let delay = backoff.record_constrained(cluster, &outcome.key, Instant::now());
                        warn!(%cluster, resource = %outcome.key, ?delay, "compute resource capacity constrained");
                        constrained.push(outcome.key.clone());
                    } else if outcome.is_complete() {
                        backoff.record_success(cluster, &outcome.key);
                    }
                }

                if let (Some(class), Some(error)) = (outcome.error, error) {
                    match class {
                        ErrorClass::CapacityConstrained => {}
                        ErrorClass::Fatal => {
                            error!(%cluster, resource = %outcome.key, %error, "fatal provider error during launch");
                            fatal.get_or_insert(error);
                        }
                        _ => {
                            warn!(%cluster, resource = %outcome.key, %class, %error, "launch failed");
                            report.failures.push(ResourceFailure {
                                key: outcome.key.clone(),
                                class,
                                message: error.to_string(),
                            });
                        }
                    }
                }
            }

            match resolve_queue_outcome(queue.strategy, &outcomes) {
                QueueResolution::Commit => {
                    report.launched += outcomes.iter().map(|o| o.launched.len() as u32).sum::<u32>();
                }
                QueueResolution::RollBack { instances } if instances.is_empty() => {}
                QueueResolution::RollBack { instances } => {
                    warn!(
                        %cluster,
                        queue = %queue.name,
                        count = instances.len(),
                        "capacity shortfall in all-or-nothing queue, rolling back launches"
                    );
                    match self.terminate(&instances).await {
                        Ok(()) => report.rolled_back += instances.len() as u32,
                        Err(e) => {
                            error!(
                                %cluster,
                                queue = %queue.name,
                                count = instances.len(),
                                error = %e,
                                "rollback termination failed; retrying next tick"
                            );
                            self.defer_rollback(cluster, &instances);
                            report.pending_rollback.extend(instances);
                        }
                    }
                }
            }
        }

        if let Some(error) = fatal {
            return Err(LifecycleError::provider(error));
        }

        report.capacity = plan
            .resources()
            .map(|r| ResourceCapacity {
                key: r.key.clone(),
                status: if constrained.contains(&r.key) {
                    CapacityStatus::Degraded
                } else {
                    r.capacity_status()
                },
            })
            .collect();

        Ok(report)
    }

    /// Launch every resource's increment concurrently and wait for all.
    async fn launch_all(
        &self,
        cluster: &str,
        topology: &Topology,
        plan: &ScalingPlan,
    ) -> LifecycleResult<BTreeMap<String, Vec<LaunchResult>>> {
        let mut set = JoinSet::new();

        for queue in &plan.queues {
            for resource in queue.resources.iter().filter(|r| r.launch > 0) {
                let Some((queue_def, cr)) = topology.resolve(&resource.key) else {
                    return Err(LifecycleError::provider(ProviderError::Malformed(format!(
                        "plan references unknown compute resource {}",
                        resource.key
                    ))));
                };
                let request = LaunchRequest {
                    cluster: cluster.to_string(),
                    queue: queue_def.name.clone(),
                    compute_resource: cr.name.clone(),
                    instance_types: cr.instance_types.clone(),
                    subnet_ids: queue_def.subnet_ids.clone(),
                    count: resource.launch,
                };
                let provider = Arc::clone(&self.provider);
                let timeout = self.policy.timeout;
                let key = resource.key.clone();

                debug!(%cluster, resource = %key, count = request.count, "launching instances");
                set.spawn(async move {
                    let result = match tokio::time::timeout(timeout, provider.launch(&request)).await {
                        Ok(result) => result,
                        Err(_) => Err(LaunchFailure::from(ProviderError::Timeout(timeout))),
                    };
                    let (launched, error) = match result {
                        Ok(ids) => (ids, None),
                        Err(failure) => (failure.launched, Some(failure.error)),
                    };
                    LaunchResult {
                        queue: request.queue,
                        outcome: LaunchOutcome {
                            key,
                            requested: request.count,
                            launched,
                            error: error.as_ref().map(classify),
                        },
                        error,
                    }
                });
            }
        }

        let mut by_queue: BTreeMap<String, Vec<LaunchResult>> = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(|e| LifecycleError::Task(e.to_string()))?;
            by_queue.entry(result.queue.clone()).or_default().push(result);
        }
        Ok(by_queue)
    }

    /// Terminate instances; ones already gone are not an error.
    pub async fn terminate(&self, instances: &[InstanceId]) -> LifecycleResult<()> {
        let provider = &self.provider;
        match with_retry(&self.policy, "terminate", || provider.terminate(instances)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "some instances were already gone");
                Ok(())
            }
            Err(e) => Err(LifecycleError::provider(e)),
        }
    }
}
