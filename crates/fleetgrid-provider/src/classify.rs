//! Capacity error classifier.
//!
//! Maps provider failures onto the handful of routes the engine knows how
//! to take. Unknown service codes are treated as fatal rather than guessed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// How a provider failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient; retry with bounded backoff.
    Retryable,
    /// Requested capacity temporarily unavailable; throttle the resource.
    CapacityConstrained,
    /// Account or service quota hit; terminal for the operation.
    LimitExceeded,
    /// Credentials lack permission; terminal for the operation.
    Unauthorized,
    /// Invariant violated or response not understood; abort and alert.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::CapacityConstrained => "capacity_constrained",
            ErrorClass::LimitExceeded => "limit_exceeded",
            ErrorClass::Unauthorized => "unauthorized",
            ErrorClass::Fatal => "fatal",
        }
    }

    /// Terminal for a lifecycle operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorClass::LimitExceeded | ErrorClass::Unauthorized | ErrorClass::Fatal
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CAPACITY_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientHostCapacity",
    "InsufficientReservedInstanceCapacity",
    "InsufficientCapacity",
];

const LIMIT_CODES: &[&str] = &[
    "InstanceLimitExceeded",
    "VcpuLimitExceeded",
    "MaxSpotInstanceCountExceeded",
];

const UNAUTHORIZED_CODES: &[&str] = &["UnauthorizedOperation", "AuthFailure", "AccessDenied"];

const RETRYABLE_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ServiceUnavailable",
    "InternalError",
];

/// Classify a provider failure.
pub fn classify(error: &ProviderError) -> ErrorClass {
    match error {
        ProviderError::Api { code, .. } => classify_code(code),
        ProviderError::Timeout(_) | ProviderError::Transport(_) => ErrorClass::Retryable,
        // Callers that expect NotFound (deletes) handle it before classifying.
        ProviderError::NotFound(_) | ProviderError::Malformed(_) => ErrorClass::Fatal,
    }
}

fn classify_code(code: &str) -> ErrorClass {
    if CAPACITY_CODES.contains(&code) {
        ErrorClass::CapacityConstrained
    } else if LIMIT_CODES.contains(&code) {
        ErrorClass::LimitExceeded
    } else if UNAUTHORIZED_CODES.contains(&code) {
        ErrorClass::Unauthorized
    } else if RETRYABLE_CODES.contains(&code) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}
