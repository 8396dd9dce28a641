//! Queue-level resolution of a tick's launch results.

use fleet_core::{InstanceId, ResourceKey, ScalingStrategy};
use fleetgrid_provider::ErrorClass;

/// What one compute resource's launch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub key: ResourceKey,
    pub requested: u32,
    /// Instances that are running now, even if the launch failed part way.
    pub launched: Vec<InstanceId>,
    pub error: Option<ErrorClass>,
}

impl LaunchOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.launched.len() as u32 >= self.requested
    }

    pub fn is_capacity_constrained(&self) -> bool {
        self.error == Some(ErrorClass::CapacityConstrained)
    }
}

/// Decision for a queue once all of its launches have reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueResolution {
    /// Keep everything that was launched.
    Commit,
    /// Terminate every instance launched in the queue this tick.
    RollBack { instances: Vec<InstanceId> },
}

/// Resolve a queue's launches. Must only be called with the outcomes of
/// every compute resource in the queue.
pub fn resolve_queue_outcome(strategy: ScalingStrategy, outcomes: &[LaunchOutcome]) -> QueueResolution {
    let constrained = outcomes.iter().any(LaunchOutcome::is_capacity_constrained);
    match strategy {
        ScalingStrategy::AllOrNothing if constrained => QueueResolution::RollBack {
            instances: outcomes
                .iter()
                .flat_map(|o| o.launched.iter().cloned())
                .collect(),
        },
        _ => QueueResolution::Commit,
    }
}
