//! Scaling plan types.

use fleet_core::{InstanceId, ResourceKey, ResourceKind, ScalingStrategy};
use serde::{Deserialize, Serialize};

/// Why an instance is being terminated. Variant order is termination
/// priority within a compute resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Unhealthy,
    CapacityError,
    Orphaned,
    /// Excess usable capacity; longest idle first.
    ScaleDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    pub instance: InstanceId,
    pub reason: TerminationReason,
}

/// Notes attached to a resource plan instead of raising errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Annotation {
    /// Launches suppressed while capacity backoff is active.
    Throttled,
    /// Launches held back because another resource in the all-or-nothing
    /// queue is throttled.
    Deferred { blocked_by: ResourceKey },
    /// A static resource runs more instances than its declared count.
    Overcapacity { excess: u32 },
}

/// Capacity status reported per compute resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityStatus {
    #[default]
    Nominal,
    Degraded,
}

/// Planned changes for one compute resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePlan {
    pub key: ResourceKey,
    pub kind: ResourceKind,
    pub desired: u32,
    /// All tracked instances, including ones scheduled for termination.
    pub total: u32,
    pub usable: u32,
    /// Instances still waiting for a health signal.
    pub pending: u32,
    pub launch: u32,
    pub terminate: Vec<Termination>,
    pub annotations: Vec<Annotation>,
}

impl ResourcePlan {
    /// Signed change in instance count.
    pub fn delta(&self) -> i64 {
        i64::from(self.launch) - self.terminate.len() as i64
    }

    /// Instance count once the plan has been applied.
    pub fn projected_total(&self) -> u32 {
        (self.total + self.launch).saturating_sub(self.terminate.len() as u32)
    }

    pub fn capacity_status(&self) -> CapacityStatus {
        let degraded = self
            .annotations
            .iter()
            .any(|a| matches!(a, Annotation::Throttled | Annotation::Deferred { .. }));
        if degraded {
            CapacityStatus::Degraded
        } else {
            CapacityStatus::Nominal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePlan {
    pub name: String,
    pub strategy: ScalingStrategy,
    pub resources: Vec<ResourcePlan>,
}

impl QueuePlan {
    pub fn launches(&self) -> u32 {
        self.resources.iter().map(|r| r.launch).sum()
    }
}

/// Everything a reconciliation tick wants done to a cluster's fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPlan {
    pub cluster: String,
    pub queues: Vec<QueuePlan>,
    /// Instances whose queue or compute resource no longer exists.
    pub orphans: Vec<Termination>,
}

impl ScalingPlan {
    pub fn resources(&self) -> impl Iterator<Item = &ResourcePlan> {
        self.queues.iter().flat_map(|q| q.resources.iter())
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourcePlan> {
        self.resources().find(|r| &r.key == key)
    }

    /// Every termination in the plan, orphans included.
    pub fn terminations(&self) -> impl Iterator<Item = &Termination> {
        self.resources()
            .flat_map(|r| r.terminate.iter())
            .chain(self.orphans.iter())
    }

    pub fn is_noop(&self) -> bool {
        self.terminations().next().is_none() && self.queues.iter().all(|q| q.launches() == 0)
    }
}
