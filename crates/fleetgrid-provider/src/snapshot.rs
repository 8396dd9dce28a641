//! Fleet state snapshot — point-in-time view of a cluster's compute fleet.
//!
//! Instances are grouped by the queue and compute-resource tags the engine
//! put on them at launch. Anything that no longer fits the current topology
//! is flagged as an orphan and becomes a termination target regardless of
//! its health.

use std::collections::BTreeMap;

use fleet_core::{InstanceId, ResourceKey, Topology};
use fleetgrid_health::InstanceHealth;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::{classify, ErrorClass};
use crate::error::ProviderError;
use crate::provider::*;
use crate::retry::{with_retry, RetryPolicy};

/// Why an instance no longer belongs to the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// Compute node without queue/compute-resource tags.
    MissingTags,
    UnknownQueue,
    UnknownComputeResource,
    /// The compute resource exists but no longer lists this instance type.
    IneligibleInstanceType,
}

/// A tracked compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub instance_type: String,
    pub launched_at: u64,
    pub idle_secs: u64,
    pub health: InstanceHealth,
    pub capacity_error: bool,
    pub orphaned: Option<OrphanReason>,
}

impl Instance {
    fn from_report(report: InstanceReport, orphaned: Option<OrphanReason>) -> Self {
        Self {
            id: report.id,
            instance_type: report.instance_type,
            launched_at: report.launched_at,
            idle_secs: report.idle_secs,
            health: report.health,
            capacity_error: report.capacity_error,
            orphaned,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.is_some()
    }
}

/// Running instances of one cluster, grouped by compute resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub cluster: String,
    /// Every compute resource of the topology, including empty ones.
    pub resources: BTreeMap<ResourceKey, Vec<Instance>>,
    /// Instances whose queue or compute resource is gone.
    pub orphans: Vec<Instance>,
}

impl Snapshot {
    pub fn instances(&self, key: &ResourceKey) -> &[Instance] {
        self.resources.get(key).map_or(&[], Vec::as_slice)
    }

    /// Number of compute instances tracked, orphans included.
    pub fn total_instances(&self) -> usize {
        self.resources.values().map(Vec::len).sum::<usize>() + self.orphans.len()
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.resources
            .values()
            .flatten()
            .chain(self.orphans.iter())
            .map(|i| i.id.clone())
            .collect()
    }

    /// Group provider reports against a topology.
    pub fn group(cluster: &str, topology: &Topology, reports: Vec<InstanceReport>) -> Self {
        let mut resources: BTreeMap<ResourceKey, Vec<Instance>> = topology
            .resource_keys()
            .into_iter()
            .map(|key| (key, Vec::new()))
            .collect();
        let mut orphans = Vec::new();

        for report in reports {
            if report.id.is_empty() {
                warn!(%cluster, "skipping instance report without an id");
                continue;
            }
            if report.tag(TAG_CLUSTER) != Some(cluster) {
                warn!(%cluster, instance = %report.id, "provider returned an instance of another cluster");
                continue;
            }
            // Head and login nodes are not part of the compute fleet.
            if report.node_type() != Some(NodeType::Compute) {
                continue;
            }

            let (queue, cr) = match (report.tag(TAG_QUEUE), report.tag(TAG_COMPUTE_RESOURCE)) {
                (Some(q), Some(c)) => (q.to_string(), c.to_string()),
                _ => {
                    orphans.push(Instance::from_report(report, Some(OrphanReason::MissingTags)));
                    continue;
                }
            };

            let Some(queue_def) = topology.queue(&queue) else {
                debug!(%cluster, instance = %report.id, %queue, "instance of removed queue");
                orphans.push(Instance::from_report(report, Some(OrphanReason::UnknownQueue)));
                continue;
            };
            let Some(cr_def) = queue_def.compute_resource(&cr) else {
                debug!(%cluster, instance = %report.id, %queue, compute_resource = %cr, "instance of removed compute resource");
                orphans.push(Instance::from_report(report, Some(OrphanReason::UnknownComputeResource)));
                continue;
            };

            let orphaned = (!cr_def.is_eligible(&report.instance_type))
                .then_some(OrphanReason::IneligibleInstanceType);
            resources
                .entry(queue_def.key_for(cr_def))
                .or_default()
                .push(Instance::from_report(report, orphaned));
        }

        Self {
            cluster: cluster.to_string(),
            resources,
            orphans,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// Transient failures outlasted the retry budget.
    #[error("fleet snapshot unavailable after {attempts} attempt(s): {error}")]
    Unavailable { attempts: u32, error: ProviderError },

    #[error("fleet snapshot failed ({class}): {error}")]
    Failed { class: ErrorClass, error: ProviderError },
}

/// Capture a snapshot of the cluster's fleet, retrying transient errors.
pub async fn capture(
    provider: &dyn FleetProvider,
    cluster: &str,
    topology: &Topology,
    policy: &RetryPolicy,
) -> Result<Snapshot, SnapshotError> {
    let reports = with_retry(policy, "list_instances", || provider.list_instances(cluster))
        .await
        .map_err(|error| match classify(&error) {
            ErrorClass::Retryable => SnapshotError::Unavailable {
                attempts: policy.max_attempts,
                error,
            },
            class => SnapshotError::Failed { class, error },
        })?;

    let snapshot = Snapshot::group(cluster, topology, reports);
    debug!(
        %cluster,
        instances = snapshot.total_instances(),
        orphans = snapshot.orphans.len(),
        "fleet snapshot captured"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::{InMemoryProvider, ProviderCall};
    use fleet_core::{ComputeResource, HealthChecks, Queue, ResourceKind, ScalingStrategy};

    fn topology() -> Topology {
        Topology {
            scaling_strategy: ScalingStrategy::BestEffort,
            queues: vec![Queue {
                name: "compute".to_string(),
                subnet_ids: vec!["subnet-1".to_string()],
                health_checks: HealthChecks::new(),
                scaling_strategy: None,
                compute_resources: vec![
                    ComputeResource {
                        name: "cpu".to_string(),
                        instance_types: vec!["c5.xlarge".to_string()],
                        min_count: 0,
                        max_count: 4,
                        kind: ResourceKind::Dynamic,
                        health_checks: HealthChecks::new(),
                    },
                    ComputeResource {
                        name: "mem".to_string(),
                        instance_types: vec!["r5.xlarge".to_string()],
                        min_count: 0,
                        max_count: 4,
                        kind: ResourceKind::Dynamic,
                        health_checks: HealthChecks::new(),
                    },
                ],
            }],
        }
    }

    fn report(id: &str, instance_type: &str, tags: &[(&str, &str)]) -> InstanceReport {
        InstanceReport {
            id: id.to_string(),
            instance_type: instance_type.to_string(),
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            launched_at: 0,
            idle_secs: 0,
            health: InstanceHealth::healthy(),
            capacity_error: false,
        }
    }

    fn compute(id: &str, instance_type: &str, queue: &str, cr: &str) -> InstanceReport {
        report(
            id,
            instance_type,
            &[
                (TAG_CLUSTER, "hpc"),
                (TAG_NODE_TYPE, "Compute"),
                (TAG_QUEUE, queue),
                (TAG_COMPUTE_RESOURCE, cr),
            ],
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn groups_by_resource_tags() {
        let snapshot = Snapshot::group(
            "hpc",
            &topology(),
            vec![
                compute("i-1", "c5.xlarge", "compute", "cpu"),
                compute("i-2", "c5.xlarge", "compute", "cpu"),
                compute("i-3", "r5.xlarge", "compute", "mem"),
            ],
        );
        assert_eq!(snapshot.instances(&ResourceKey::new("compute", "cpu")).len(), 2);
        assert_eq!(snapshot.instances(&ResourceKey::new("compute", "mem")).len(), 1);
        assert!(snapshot.orphans.is_empty());
    }

    #[test]
    fn empty_resources_are_present() {
        let snapshot = Snapshot::group("hpc", &topology(), vec![]);
        assert_eq!(snapshot.resources.len(), 2);
        assert_eq!(snapshot.total_instances(), 0);
    }

    #[test]
    fn flags_orphans() {
        let snapshot = Snapshot::group(
            "hpc",
            &topology(),
            vec![
                compute("i-1", "c5.xlarge", "old-queue", "cpu"),
                compute("i-2", "c5.xlarge", "compute", "gone"),
                report("i-3", "c5.xlarge", &[(TAG_CLUSTER, "hpc"), (TAG_NODE_TYPE, "Compute")]),
                compute("i-4", "m5.large", "compute", "cpu"),
            ],
        );

        let reasons: Vec<_> = snapshot.orphans.iter().map(|i| i.orphaned).collect();
        assert_eq!(
            reasons,
            [
                Some(OrphanReason::UnknownQueue),
                Some(OrphanReason::UnknownComputeResource),
                Some(OrphanReason::MissingTags),
            ]
        );

        // Resource-level orphan stays with its resource.
        let cpu = snapshot.instances(&ResourceKey::new("compute", "cpu"));
        assert_eq!(cpu.len(), 1);
        assert_eq!(cpu[0].orphaned, Some(OrphanReason::IneligibleInstanceType));
    }

    #[test]
    fn ignores_non_compute_nodes_and_foreign_instances() {
        let snapshot = Snapshot::group(
            "hpc",
            &topology(),
            vec![
                report("i-head", "c5.large", &[(TAG_CLUSTER, "hpc"), (TAG_NODE_TYPE, "HeadNode")]),
                report("i-login", "c5.large", &[(TAG_CLUSTER, "hpc"), (TAG_NODE_TYPE, "LoginNode")]),
                report("i-other", "c5.xlarge", &[(TAG_CLUSTER, "other"), (TAG_NODE_TYPE, "Compute")]),
                compute("", "c5.xlarge", "compute", "cpu"),
            ],
        );
        assert_eq!(snapshot.total_instances(), 0);
    }

    #[tokio::test]
    async fn capture_retries_transient_errors() {
        let provider = InMemoryProvider::new();
        provider.insert(compute("i-1", "c5.xlarge", "compute", "cpu")).await;
        provider
            .fail_next(ProviderCall::ListInstances, ProviderError::api("Throttling", "slow down"))
            .await;

        let snapshot = capture(&provider, "hpc", &topology(), &policy()).await.unwrap();
        assert_eq!(snapshot.total_instances(), 1);
        assert_eq!(provider.calls(ProviderCall::ListInstances).await, 2);
    }

    #[tokio::test]
    async fn capture_surfaces_unavailable_after_budget() {
        let provider = InMemoryProvider::new();
        for _ in 0..3 {
            provider
                .fail_next(ProviderCall::ListInstances, ProviderError::Transport("reset".into()))
                .await;
        }

        let err = capture(&provider, "hpc", &topology(), &policy()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Unavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn capture_does_not_retry_authorization_failures() {
        let provider = InMemoryProvider::new();
        provider
            .fail_next(ProviderCall::ListInstances, ProviderError::api("AuthFailure", "bad creds"))
            .await;

        let err = capture(&provider, "hpc", &topology(), &policy()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Failed { class: ErrorClass::Unauthorized, .. }));
        assert_eq!(provider.calls(ProviderCall::ListInstances).await, 1);
    }
}
