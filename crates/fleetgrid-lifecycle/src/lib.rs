//! fleetgrid-lifecycle — cluster lifecycle and reconciliation for FleetGrid.
//!
//! The [`Orchestrator`] owns each cluster's externally visible state. It
//! runs CREATE/UPDATE/DELETE as idempotent transitions and, for ACTIVE
//! clusters, periodic reconciliation ticks:
//!
//! ```text
//! tick(cluster)
//!   ├── try_lock(cluster)              skip if a transition is running
//!   ├── finish pending rollbacks
//!   ├── capture(provider, topology)    abort on SnapshotUnavailable
//!   ├── compute fleet stopped?         drain, launch nothing
//!   ├── demand.demand(cluster)
//!   ├── reconcile(...) → ScalingPlan   pure
//!   └── PlanExecutor::execute
//!         ├── terminate (batched)
//!         ├── launch per compute resource (concurrent, JoinSet)
//!         ├── per queue: resolve_queue_outcome → commit | roll back
//!         └── CapacityBackoff bookkeeping
//! ```
//!
//! Failures map onto a fixed API taxonomy via [`ApiErrorKind`].

pub mod error;
pub mod executor;
pub mod idempotency;
pub mod locks;
pub mod orchestrator;

pub use error::{ApiError, ApiErrorKind, LifecycleError, LifecycleResult};
pub use executor::{PendingRollbacks, PlanExecutor, ResourceCapacity, ResourceFailure, TickReport};
pub use locks::{ClusterGuard, ClusterLocks, Contention, Holder};
pub use orchestrator::{
    ClusterDescription, CreateRequest, DeleteRequest, Orchestrator, SkipReason, TickOutcome,
    UpdateRequest,
};
