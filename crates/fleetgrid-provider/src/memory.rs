//! In-memory fleet provider.
//!
//! Backs `fleetd run` in simulation mode and every engine test. Capacity
//! can be limited per instance type, faults injected per call, and every
//! call is counted so tests can assert that replays issue no side effects.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fleet_core::{InstanceId, Topology};
use fleetgrid_health::InstanceHealth;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::*;

/// Provider operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderCall {
    Launch,
    Terminate,
    ListInstances,
    Provision,
    UpdateInfrastructure,
    Teardown,
    InfrastructureExists,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<InstanceId, InstanceReport>,
    infrastructure: BTreeSet<String>,
    retained_logs: BTreeSet<String>,
    /// Remaining launchable capacity per instance type; absent = unlimited.
    capacity: HashMap<String, u32>,
    faults: HashMap<ProviderCall, VecDeque<ProviderError>>,
    latency: HashMap<ProviderCall, Duration>,
    calls: HashMap<ProviderCall, u32>,
    /// Existence checks that still report infrastructure after teardown.
    lingering: HashMap<String, u32>,
    launch_health: InstanceHealth,
    next_id: u64,
}

impl Inner {
    /// Count the call and pop an injected fault for it, if any.
    fn enter(&mut self, call: ProviderCall) -> Result<(), ProviderError> {
        *self.calls.entry(call).or_insert(0) += 1;
        match self.faults.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A fleet that lives in process memory.
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                launch_health: InstanceHealth::fully_healthy(),
                ..Default::default()
            }),
        }
    }

    /// Limit how many more instances of `instance_type` can be launched.
    /// `None` removes the limit.
    pub async fn set_capacity(&self, instance_type: &str, remaining: Option<u32>) {
        let mut inner = self.inner.lock().await;
        match remaining {
            Some(n) => inner.capacity.insert(instance_type.to_string(), n),
            None => inner.capacity.remove(instance_type),
        };
    }

    /// Fail the next call of `call` with `error`. Faults queue up.
    pub async fn fail_next(&self, call: ProviderCall, error: ProviderError) {
        let mut inner = self.inner.lock().await;
        inner.faults.entry(call).or_default().push_back(error);
    }

    /// Delay every `call` by `latency` before it runs.
    pub async fn set_latency(&self, call: ProviderCall, latency: Duration) {
        self.inner.lock().await.latency.insert(call, latency);
    }

    /// Keep reporting infrastructure for `checks` existence checks after teardown.
    pub async fn linger_after_teardown(&self, cluster: &str, checks: u32) {
        self.inner.lock().await.lingering.insert(cluster.to_string(), checks);
    }

    /// Health signal given to newly launched instances.
    pub async fn set_launch_health(&self, health: InstanceHealth) {
        self.inner.lock().await.launch_health = health;
    }

    /// Add an instance directly, as if launched outside the engine.
    pub async fn insert(&self, report: InstanceReport) {
        self.inner.lock().await.instances.insert(report.id.clone(), report);
    }

    pub async fn set_health(&self, id: &str, health: InstanceHealth) {
        if let Some(report) = self.inner.lock().await.instances.get_mut(id) {
            report.health = health;
        }
    }

    pub async fn set_idle(&self, id: &str, idle_secs: u64) {
        if let Some(report) = self.inner.lock().await.instances.get_mut(id) {
            report.idle_secs = idle_secs;
        }
    }

    /// How many times `call` was made.
    pub async fn calls(&self, call: ProviderCall) -> u32 {
        self.inner.lock().await.calls.get(&call).copied().unwrap_or(0)
    }

    /// Total number of provider calls of any kind.
    pub async fn total_calls(&self) -> u32 {
        self.inner.lock().await.calls.values().sum()
    }

    /// Instances of a cluster, without counting a provider call.
    pub async fn instances(&self, cluster: &str) -> Vec<InstanceReport> {
        let inner = self.inner.lock().await;
        inner
            .instances
            .values()
            .filter(|r| r.tag(TAG_CLUSTER) == Some(cluster))
            .cloned()
            .collect()
    }

    pub async fn has_infrastructure(&self, cluster: &str) -> bool {
        self.inner.lock().await.infrastructure.contains(cluster)
    }

    pub async fn logs_retained(&self, cluster: &str) -> bool {
        self.inner.lock().await.retained_logs.contains(cluster)
    }

    async fn simulate_latency(&self, call: ProviderCall) {
        let latency = self.inner.lock().await.latency.get(&call).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl FleetProvider for InMemoryProvider {
    async fn launch(&self, request: &LaunchRequest) -> Result<Vec<InstanceId>, LaunchFailure> {
        self.simulate_latency(ProviderCall::Launch).await;
        let mut inner = self.inner.lock().await;
        inner.enter(ProviderCall::Launch)?;

        let now = epoch_secs();
        let tags = request.tags();
        let mut launched = Vec::new();
        let mut remaining = request.count;

        for instance_type in &request.instance_types {
            if remaining == 0 {
                break;
            }
            let available = inner.capacity.get(instance_type).copied().unwrap_or(u32::MAX);
            let take = remaining.min(available);
            if let Some(cap) = inner.capacity.get_mut(instance_type) {
                *cap -= take;
            }
            for _ in 0..take {
                inner.next_id += 1;
                let id = format!("i-{:08x}", inner.next_id);
                let report = InstanceReport {
                    id: id.clone(),
                    instance_type: instance_type.clone(),
                    tags: tags.clone(),
                    launched_at: now,
                    idle_secs: 0,
                    health: inner.launch_health.clone(),
                    capacity_error: false,
                };
                inner.instances.insert(id.clone(), report);
                launched.push(id);
            }
            remaining -= take;
        }

        debug!(
            cluster = %request.cluster,
            queue = %request.queue,
            compute_resource = %request.compute_resource,
            requested = request.count,
            launched = launched.len(),
            "simulated launch"
        );

        if remaining > 0 {
            return Err(LaunchFailure {
                launched,
                error: ProviderError::api(
                    "InsufficientInstanceCapacity",
                    format!("insufficient capacity for {remaining} instance(s)"),
                ),
            });
        }
        Ok(launched)
    }

    async fn terminate(&self, instances: &[InstanceId]) -> Result<(), ProviderError> {
        self.simulate_latency(ProviderCall::Terminate).await;
        let mut inner = self.inner.lock().await;
        inner.enter(ProviderCall::Terminate)?;

        let mut missing = Vec::new();
        for id in instances {
            match inner.instances.remove(id) {
                Some(report) => {
                    if let Some(cap) = inner.capacity.get_mut(&report.instance_type) {
                        *cap += 1;
                    }
                }
                None => missing.push(id.as_str()),
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::NotFound(missing.join(",")))
        }
    }

    async fn list_instances(&self, cluster: &str) -> Result<Vec<InstanceReport>, ProviderError> {
        self.simulate_latency(ProviderCall::ListInstances).await;
        let mut inner = self.inner.lock().await;
        inner.enter(ProviderCall::ListInstances)?;
        Ok(inner
            .instances
            .values()
            .filter(|r| r.tag(TAG_CLUSTER) == Some(cluster))
            .cloned()
            .collect())
    }

    async fn provision(&self, cluster: &str, _topology: &Topology) -> Result<(), ProviderError> {
        self.simulate_latency(ProviderCall::Provision).await;
        let mut inner = self.inner.lock().await;
        inner.enter(ProviderCall::Provision)?;
        inner.infrastructure.insert(cluster.to_string());
        inner.retained_logs.remove(cluster);
        Ok(())
    }

    async fn update_infrastructure(
        &self,
        cluster: &str,
        _topology: &Topology,
    ) -> Result<(), ProviderError> {
        self.simulate_latency(ProviderCall::UpdateInfrastructure).await;
        let mut inner = self.inner.lock().await;
        inner.enter(ProviderCall::UpdateInfrastructure)?;
        if !inner.infrastructure.contains(cluster) {
            return Err(ProviderError::NotFound(format!("infrastructure of {cluster}")));
        }
        Ok(())
    }

    async fn teardown(&self, cluster: &str, retain_logs: bool) -> Result<(), ProviderError> {
        self.simulate_latency(ProviderCall::Teardown).await;
        let mut inner = self.inner.lock().await;
        inner.enter(ProviderCall::Teardown)?;
        inner.infrastructure.remove(cluster);
        if retain_logs {
            inner.retained_logs.insert(cluster.to_string());
        }
        Ok(())
    }

    async fn infrastructure_exists(&self, cluster: &str) -> Result<bool, ProviderError> {
        self.simulate_latency(ProviderCall::InfrastructureExists).await;
        let mut inner = self.inner.lock().await;
        inner.enter(ProviderCall::InfrastructureExists)?;
        if let Some(left) = inner.lingering.get_mut(cluster) {
            if *left > 0 {
                *left -= 1;
                return Ok(true);
            }
        }
        Ok(inner.infrastructure.contains(cluster))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(count: u32, instance_types: &[&str]) -> LaunchRequest {
        LaunchRequest {
            cluster: "hpc".to_string(),
            queue: "compute".to_string(),
            compute_resource: "cpu".to_string(),
            instance_types: instance_types.iter().map(|t| t.to_string()).collect(),
            subnet_ids: vec!["subnet-1".to_string()],
            count,
        }
    }

    fn empty_topology() -> Topology {
        Topology {
            scaling_strategy: Default::default(),
            queues: vec![],
        }
    }

    #[tokio::test]
    async fn launch_tags_instances() {
        let provider = InMemoryProvider::new();
        let ids = provider.launch(&request(2, &["c5.xlarge"])).await.unwrap();
        assert_eq!(ids.len(), 2);

        let listed = provider.list_instances("hpc").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].tag(TAG_QUEUE), Some("compute"));
        assert_eq!(listed[0].node_type(), Some(NodeType::Compute));
        assert!(provider.list_instances("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn launch_falls_back_through_instance_types() {
        let provider = InMemoryProvider::new();
        provider.set_capacity("c5.xlarge", Some(1)).await;

        let ids = provider.launch(&request(3, &["c5.xlarge", "c5.2xlarge"])).await.unwrap();
        assert_eq!(ids.len(), 3);
        let types: BTreeSet<String> = provider
            .instances("hpc")
            .await
            .into_iter()
            .map(|r| r.instance_type)
            .collect();
        assert_eq!(types.len(), 2);
    }

    #[tokio::test]
    async fn partial_launch_reports_what_started() {
        let provider = InMemoryProvider::new();
        provider.set_capacity("c5.xlarge", Some(1)).await;

        let failure = provider.launch(&request(3, &["c5.xlarge"])).await.unwrap_err();
        assert_eq!(failure.launched.len(), 1);
        assert_eq!(failure.error.code(), Some("InsufficientInstanceCapacity"));
    }

    #[tokio::test]
    async fn terminate_reports_missing_instances_after_removing_the_rest() {
        let provider = InMemoryProvider::new();
        let ids = provider.launch(&request(1, &["c5.xlarge"])).await.unwrap();

        let err = provider
            .terminate(&[ids[0].clone(), "i-gone".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(provider.instances("hpc").await.is_empty());
    }

    #[tokio::test]
    async fn injected_faults_fire_once_and_calls_are_counted() {
        let provider = InMemoryProvider::new();
        provider
            .fail_next(ProviderCall::Provision, ProviderError::api("AccessDenied", "no"))
            .await;

        assert!(provider.provision("hpc", &empty_topology()).await.is_err());
        assert!(provider.provision("hpc", &empty_topology()).await.is_ok());
        assert_eq!(provider.calls(ProviderCall::Provision).await, 2);
        assert!(provider.has_infrastructure("hpc").await);
    }

    #[tokio::test]
    async fn teardown_can_linger() {
        let provider = InMemoryProvider::new();
        provider.provision("hpc", &empty_topology()).await.unwrap();
        provider.linger_after_teardown("hpc", 1).await;
        provider.teardown("hpc", true).await.unwrap();

        assert!(provider.infrastructure_exists("hpc").await.unwrap());
        assert!(!provider.infrastructure_exists("hpc").await.unwrap());
        assert!(provider.logs_retained("hpc").await);
    }
}
