//! The fleet provider contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_core::{InstanceId, Topology};
use fleetgrid_health::InstanceHealth;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Tag carrying the owning cluster's name.
pub const TAG_CLUSTER: &str = "fleetgrid:cluster-name";
/// Tag carrying the node role (`HeadNode`, `LoginNode`, `Compute`).
pub const TAG_NODE_TYPE: &str = "fleetgrid:node-type";
pub const TAG_QUEUE: &str = "fleetgrid:queue-name";
pub const TAG_COMPUTE_RESOURCE: &str = "fleetgrid:compute-resource-name";

/// Role of an instance within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    HeadNode,
    LoginNode,
    Compute,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::HeadNode => "HeadNode",
            NodeType::LoginNode => "LoginNode",
            NodeType::Compute => "Compute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HeadNode" => Some(NodeType::HeadNode),
            "LoginNode" => Some(NodeType::LoginNode),
            "Compute" => Some(NodeType::Compute),
            _ => None,
        }
    }
}

/// An instance as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub id: InstanceId,
    pub instance_type: String,
    pub tags: BTreeMap<String, String>,
    /// Unix timestamp (seconds) the instance was launched.
    pub launched_at: u64,
    /// Seconds since the instance last ran work.
    pub idle_secs: u64,
    pub health: InstanceHealth,
    /// The last launch attempt for this instance hit insufficient capacity.
    #[serde(default)]
    pub capacity_error: bool,
}

impl InstanceReport {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn node_type(&self) -> Option<NodeType> {
        self.tag(TAG_NODE_TYPE).and_then(NodeType::parse)
    }
}

/// A request to launch `count` compute instances for one compute resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub cluster: String,
    pub queue: String,
    pub compute_resource: String,
    /// Eligible instance types, in preference order.
    pub instance_types: Vec<String>,
    pub subnet_ids: Vec<String>,
    pub count: u32,
}

impl LaunchRequest {
    /// Tags every launched instance must carry.
    pub fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (TAG_CLUSTER.to_string(), self.cluster.clone()),
            (TAG_NODE_TYPE.to_string(), NodeType::Compute.as_str().to_string()),
            (TAG_QUEUE.to_string(), self.queue.clone()),
            (TAG_COMPUTE_RESOURCE.to_string(), self.compute_resource.clone()),
        ])
    }
}

/// A launch that did not fully succeed. `launched` holds the instances that
/// did start before the failure and are now running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("launched {} before failing: {error}", .launched.len())]
pub struct LaunchFailure {
    pub launched: Vec<InstanceId>,
    pub error: ProviderError,
}

impl From<ProviderError> for LaunchFailure {
    fn from(error: ProviderError) -> Self {
        Self {
            launched: Vec::new(),
            error,
        }
    }
}

/// External compute fleet.
///
/// Infrastructure operations are keyed by cluster name and must be
/// idempotent: provisioning an existing cluster or tearing down a missing
/// one succeeds.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Launch instances for one compute resource, tagged per [`LaunchRequest::tags`].
    async fn launch(&self, request: &LaunchRequest) -> Result<Vec<InstanceId>, LaunchFailure>;

    /// Terminate instances. Ids that no longer exist yield
    /// [`ProviderError::NotFound`] after the rest were terminated.
    async fn terminate(&self, instances: &[InstanceId]) -> Result<(), ProviderError>;

    /// All instances tagged with the cluster's name.
    async fn list_instances(&self, cluster: &str) -> Result<Vec<InstanceReport>, ProviderError>;

    /// Create the cluster's backing infrastructure.
    async fn provision(&self, cluster: &str, topology: &Topology) -> Result<(), ProviderError>;

    /// Bring backing infrastructure in line with a new topology.
    async fn update_infrastructure(&self, cluster: &str, topology: &Topology)
        -> Result<(), ProviderError>;

    /// Remove backing infrastructure, optionally keeping its logs.
    async fn teardown(&self, cluster: &str, retain_logs: bool) -> Result<(), ProviderError>;

    async fn infrastructure_exists(&self, cluster: &str) -> Result<bool, ProviderError>;
}
