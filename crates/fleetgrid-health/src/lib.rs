//! fleetgrid-health — health gating for FleetGrid compute instances.
//!
//! Decides whether a running instance counts as usable capacity for its
//! compute resource. Health check settings resolve per check kind through
//! a three-level chain:
//!
//! ```text
//! compute resource override  →  queue default  →  disabled
//! ```
//!
//! An instance is usable only when its base status is healthy and every
//! check enabled for its compute resource reports healthy. Missing or
//! unknown signals fail closed.

pub mod gate;
pub mod signal;

pub use gate::{effective_check, enabled_checks, evaluate, is_usable, GateVerdict};
pub use signal::{HealthStatus, InstanceHealth};
