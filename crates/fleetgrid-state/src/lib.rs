//! fleetgrid-state — durable state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), persists what must survive a
//! process restart for reconciliation to resume mid-flight: each cluster's
//! lifecycle status and topology, and the idempotency records of accepted
//! lifecycle requests.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Clusters are keyed by name; idempotency records by `{cluster}:{token}`
//! so a prefix scan finds every token for a cluster.
//!
//! A cluster status change and the request that caused it are written in
//! one transaction (`StateStore::record_transition`), so a restart never
//! sees one without the other. Clones of `StateStore` share one database.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
