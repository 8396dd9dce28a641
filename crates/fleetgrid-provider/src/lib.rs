//! fleetgrid-provider — the contract between FleetGrid and a compute fleet.
//!
//! The [`FleetProvider`] trait is everything the engine needs from a cloud:
//! launching and terminating tagged instances, listing them with their
//! health signals, and managing per-cluster backing infrastructure.
//!
//! # Failure handling
//!
//! ```text
//! provider call ── timeout ──► ProviderError ── classify() ──► ErrorClass
//!                                                  │
//!   Retryable            → retried with bounded exponential delay
//!   CapacityConstrained  → CapacityBackoff throttles the compute resource
//!   LimitExceeded        ┐
//!   Unauthorized         ┘ terminal for the current operation
//!   Fatal                → abort and alert
//! ```

pub mod backoff;
pub mod classify;
pub mod error;
pub mod memory;
pub mod provider;
pub mod retry;
pub mod snapshot;

pub use backoff::CapacityBackoff;
pub use classify::{classify, ErrorClass};
pub use error::ProviderError;
pub use memory::{InMemoryProvider, ProviderCall};
pub use provider::*;
pub use retry::{with_retry, with_timeout, RetryPolicy};
pub use snapshot::{capture, Instance, OrphanReason, Snapshot, SnapshotError};
