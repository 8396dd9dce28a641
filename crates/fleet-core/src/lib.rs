//! fleet-core — topology model shared by every FleetGrid crate.
//!
//! A declared topology arrives as a [`RawTopology`] (parsed from TOML),
//! goes through [`validate`], and comes out as an immutable [`Topology`]:
//!
//! ```text
//! Topology
//!   └── Queue (name, subnets, default health checks, strategy override)
//!       └── ComputeResource (instance types, min/max, static|dynamic,
//!                            health check overrides)
//! ```
//!
//! Validation collects every violation instead of stopping at the first,
//! so a caller can report all problems in one round trip.

pub mod config;
pub mod digest;
pub mod types;
pub mod validate;

pub use config::{EngineConfig, RawTopology};
pub use digest::payload_digest;
pub use types::*;
pub use validate::{validate, validate_cluster, validate_cluster_name, ValidationError, Violation};
