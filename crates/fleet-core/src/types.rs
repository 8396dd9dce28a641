//! Validated topology types shared across FleetGrid crates.
//!
//! Everything in here is produced by [`crate::validate`] and treated as
//! immutable afterwards. An UPDATE replaces the whole [`Topology`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Provider-assigned identifier of a compute instance.
pub type InstanceId = String;

/// Health checks known to the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckKind {
    Gpu,
}

impl HealthCheckKind {
    pub const ALL: [HealthCheckKind; 1] = [HealthCheckKind::Gpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckKind::Gpu => "gpu",
        }
    }

    /// Parse a check name as written in a topology file (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gpu" => Some(HealthCheckKind::Gpu),
            _ => None,
        }
    }
}

impl fmt::Display for HealthCheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health check settings declared at one level of the override chain.
///
/// An absent entry means "not declared at this level", which is different
/// from an explicit `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthChecks(BTreeMap<HealthCheckKind, bool>);

impl HealthChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, handy in tests and fixtures.
    pub fn with(mut self, kind: HealthCheckKind, enabled: bool) -> Self {
        self.0.insert(kind, enabled);
        self
    }

    pub fn set(&mut self, kind: HealthCheckKind, enabled: bool) {
        self.0.insert(kind, enabled);
    }

    /// The explicitly declared setting for `kind`, if any.
    pub fn get(&self, kind: HealthCheckKind) -> Option<bool> {
        self.0.get(&kind).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a queue treats partial launch failures within a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingStrategy {
    /// Any capacity shortfall rolls back the queue's launches for the tick.
    AllOrNothing,
    /// Each compute resource scales independently.
    #[default]
    BestEffort,
}

impl ScalingStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "all-or-nothing" => Some(ScalingStrategy::AllOrNothing),
            "best-effort" => Some(ScalingStrategy::BestEffort),
            _ => None,
        }
    }
}

/// Whether a compute resource holds a fixed count or scales with demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Always runs `max_count` instances; never a scale-down target.
    Static,
    /// Scales between `min_count` and `max_count` following demand.
    #[default]
    Dynamic,
}

impl ResourceKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "static" => Some(ResourceKind::Static),
            "dynamic" => Some(ResourceKind::Dynamic),
            _ => None,
        }
    }
}

/// A named pool of instances within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResource {
    pub name: String,
    /// Eligible instance types, in preference order.
    pub instance_types: Vec<String>,
    pub min_count: u32,
    pub max_count: u32,
    pub kind: ResourceKind,
    /// Per-check overrides of the queue defaults.
    pub health_checks: HealthChecks,
}

impl ComputeResource {
    pub fn is_static(&self) -> bool {
        self.kind == ResourceKind::Static
    }

    /// Whether an instance of `instance_type` belongs in this pool.
    pub fn is_eligible(&self, instance_type: &str) -> bool {
        self.instance_types.iter().any(|t| t == instance_type)
    }
}

/// A named group of compute resources sharing subnet scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub subnet_ids: Vec<String>,
    /// Queue-level defaults for every health check kind.
    pub health_checks: HealthChecks,
    /// Overrides the topology-wide strategy for this queue.
    pub scaling_strategy: Option<ScalingStrategy>,
    pub compute_resources: Vec<ComputeResource>,
}

impl Queue {
    pub fn compute_resource(&self, name: &str) -> Option<&ComputeResource> {
        self.compute_resources.iter().find(|cr| cr.name == name)
    }

    pub fn key_for(&self, compute_resource: &ComputeResource) -> ResourceKey {
        ResourceKey::new(&self.name, &compute_resource.name)
    }
}

/// A validated, normalized compute topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub scaling_strategy: ScalingStrategy,
    pub queues: Vec<Queue>,
}

impl Topology {
    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Look up a compute resource together with its owning queue.
    pub fn resolve(&self, key: &ResourceKey) -> Option<(&Queue, &ComputeResource)> {
        let queue = self.queue(&key.queue)?;
        let cr = queue.compute_resource(&key.compute_resource)?;
        Some((queue, cr))
    }

    /// Effective strategy for a queue (queue override, else topology-wide).
    pub fn strategy_for(&self, queue: &Queue) -> ScalingStrategy {
        queue.scaling_strategy.unwrap_or(self.scaling_strategy)
    }

    /// All (queue, compute resource) keys in declaration order.
    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        self.queues
            .iter()
            .flat_map(|q| q.compute_resources.iter().map(move |cr| q.key_for(cr)))
            .collect()
    }
}

/// Unique key of a compute resource within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub queue: String,
    pub compute_resource: String,
}

impl ResourceKey {
    pub fn new(queue: &str, compute_resource: &str) -> Self {
        Self {
            queue: queue.to_string(),
            compute_resource: compute_resource.to_string(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.compute_resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cr(name: &str) -> ComputeResource {
        ComputeResource {
            name: name.to_string(),
            instance_types: vec!["c5.xlarge".to_string()],
            min_count: 0,
            max_count: 4,
            kind: ResourceKind::Dynamic,
            health_checks: HealthChecks::new(),
        }
    }

    fn topology() -> Topology {
        Topology {
            scaling_strategy: ScalingStrategy::BestEffort,
            queues: vec![
                Queue {
                    name: "compute".to_string(),
                    subnet_ids: vec!["subnet-1".to_string()],
                    health_checks: HealthChecks::new(),
                    scaling_strategy: Some(ScalingStrategy::AllOrNothing),
                    compute_resources: vec![cr("cpu"), cr("mem")],
                },
                Queue {
                    name: "gpu".to_string(),
                    subnet_ids: vec!["subnet-2".to_string()],
                    health_checks: HealthChecks::new().with(HealthCheckKind::Gpu, true),
                    scaling_strategy: None,
                    compute_resources: vec![cr("p4d")],
                },
            ],
        }
    }

    #[test]
    fn resolve_finds_queue_and_resource() {
        let t = topology();
        let (queue, cr) = t.resolve(&ResourceKey::new("gpu", "p4d")).unwrap();
        assert_eq!(queue.name, "gpu");
        assert_eq!(cr.name, "p4d");
        assert!(t.resolve(&ResourceKey::new("gpu", "cpu")).is_none());
        assert!(t.resolve(&ResourceKey::new("nope", "cpu")).is_none());
    }

    #[test]
    fn queue_strategy_overrides_topology_default() {
        let t = topology();
        assert_eq!(t.strategy_for(&t.queues[0]), ScalingStrategy::AllOrNothing);
        assert_eq!(t.strategy_for(&t.queues[1]), ScalingStrategy::BestEffort);
    }

    #[test]
    fn resource_keys_follow_declaration_order() {
        let keys: Vec<String> = topology().resource_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["compute/cpu", "compute/mem", "gpu/p4d"]);
    }

    #[test]
    fn health_checks_distinguish_absent_from_disabled() {
        let checks = HealthChecks::new();
        assert_eq!(checks.get(HealthCheckKind::Gpu), None);
        let checks = checks.with(HealthCheckKind::Gpu, false);
        assert_eq!(checks.get(HealthCheckKind::Gpu), Some(false));
    }

    #[test]
    fn strategy_parse_accepts_common_spellings() {
        assert_eq!(ScalingStrategy::parse("all-or-nothing"), Some(ScalingStrategy::AllOrNothing));
        assert_eq!(ScalingStrategy::parse("ALL_OR_NOTHING"), Some(ScalingStrategy::AllOrNothing));
        assert_eq!(ScalingStrategy::parse("best-effort"), Some(ScalingStrategy::BestEffort));
        assert_eq!(ScalingStrategy::parse("greedy"), None);
    }
}
