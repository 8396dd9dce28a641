//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// redb and codec failures, flattened to strings so callers need not
/// depend on redb's error types.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    /// A read or write inside an open table failed.
    #[error("state storage error: {0}")]
    Storage(String),

    #[error("cannot encode record: {0}")]
    Encode(String),

    /// A persisted record no longer matches the current schema.
    #[error("corrupt or incompatible record: {0}")]
    Decode(String),
}
