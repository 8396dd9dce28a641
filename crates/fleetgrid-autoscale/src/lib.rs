//! fleetgrid-autoscale — demand-driven scaling for compute resources.
//!
//! Compares a fleet snapshot against the declared topology and an external
//! demand signal, and emits a [`ScalingPlan`]. Planning is pure; executing
//! the plan against the fleet provider is the lifecycle crate's job.
//!
//! # Scaling Algorithm
//!
//! ```text
//! per compute resource:
//!   terminate  = unhealthy ∪ capacity-errored ∪ orphaned      (always)
//!   terminate += pending past the boot grace
//!   kept       = usable + pending (no health signal yet)
//!
//!   static:  desired = max
//!            launch  = max(desired - kept, 0)     // never scale down
//!
//!   dynamic: desired = clamp(demand, min, max)    // no demand → min
//!            launch  = max(desired - kept, 0)
//!            if kept > desired: terminate the longest-idle kept instances
//!
//! per queue:
//!   throttled resources launch nothing
//!   all-or-nothing: a throttled resource that wants capacity defers
//!                   every launch in its queue
//! ```
//!
//! After execution, [`resolve_queue_outcome`] decides whether a queue's
//! launches stand or are rolled back.

pub mod demand;
pub mod outcome;
pub mod plan;
pub mod reconciler;

pub use demand::{Demand, DemandSignal, StaticDemand};
pub use outcome::{resolve_queue_outcome, LaunchOutcome, QueueResolution};
pub use plan::*;
pub use reconciler::{reconcile, BootWindow};
