//! Lifecycle error types and their mapping onto the public API taxonomy.

use std::fmt;

use fleet_core::ValidationError;
use fleetgrid_provider::{classify, ErrorClass, ProviderError, SnapshotError};
use fleetgrid_state::{ClusterStatus, LifecycleOperation, StateError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the lifecycle orchestrator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("idempotency token '{token}' was already used for a different request on cluster '{cluster}'")]
    Conflict { cluster: String, token: String },

    #[error("cluster not found: {0}")]
    NotFound(String),

    #[error("cluster already exists: {0}")]
    AlreadyExists(String),

    #[error("cluster '{0}' has a lifecycle operation in progress")]
    Busy(String),

    #[error("cluster '{0}' is still reconciling; retry later")]
    ReconcileInProgress(String),

    #[error("cannot {} cluster '{cluster}' while it is {status}", .operation.as_str())]
    InvalidState {
        cluster: String,
        operation: LifecycleOperation,
        status: ClusterStatus,
    },

    #[error("provider call failed ({class}): {error}")]
    Provider { class: ErrorClass, error: ProviderError },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("demand signal unavailable: {0}")]
    Demand(anyhow::Error),

    #[error("cluster '{cluster}' did not finish deleting: {reason}")]
    DeleteIncomplete { cluster: String, reason: String },

    /// Recorded failure of an earlier request with the same token.
    #[error("{message}")]
    Replayed { kind: ApiErrorKind, message: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("payload digest failed: {0}")]
    Digest(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    Task(String),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl LifecycleError {
    pub fn provider(error: ProviderError) -> Self {
        LifecycleError::Provider {
            class: classify(&error),
            error,
        }
    }

    /// Classification of the underlying provider failure, if any.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            LifecycleError::Provider { class, .. } => Some(*class),
            LifecycleError::Snapshot(SnapshotError::Failed { class, .. }) => Some(*class),
            LifecycleError::Snapshot(SnapshotError::Unavailable { .. }) => Some(ErrorClass::Retryable),
            _ => None,
        }
    }

    /// The API error this maps to.
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            LifecycleError::Validation(_)
            | LifecycleError::Conflict { .. }
            | LifecycleError::AlreadyExists(_)
            | LifecycleError::Busy(_)
            | LifecycleError::ReconcileInProgress(_)
            | LifecycleError::InvalidState { .. } => ApiErrorKind::BadRequest,
            LifecycleError::NotFound(_) => ApiErrorKind::NotFound,
            LifecycleError::Replayed { kind, .. } => *kind,
            _ => match self.error_class() {
                Some(ErrorClass::LimitExceeded) => ApiErrorKind::LimitExceeded,
                Some(ErrorClass::Unauthorized) => ApiErrorKind::Unauthorized,
                _ => ApiErrorKind::InternalService,
            },
        }
    }
}

/// The fixed error taxonomy exposed to lifecycle API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiErrorKind {
    #[serde(rename = "InternalServiceException")]
    InternalService,
    #[serde(rename = "BadRequestException")]
    BadRequest,
    #[serde(rename = "NotFoundException")]
    NotFound,
    #[serde(rename = "UnauthorizedClientError")]
    Unauthorized,
    #[serde(rename = "LimitExceededException")]
    LimitExceeded,
}

impl ApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::InternalService => "InternalServiceException",
            ApiErrorKind::BadRequest => "BadRequestException",
            ApiErrorKind::NotFound => "NotFoundException",
            ApiErrorKind::Unauthorized => "UnauthorizedClientError",
            ApiErrorKind::LimitExceeded => "LimitExceededException",
        }
    }

    /// Parse a recorded code. Unknown codes map to an internal error.
    pub fn from_code(code: &str) -> Self {
        match code {
            "BadRequestException" => ApiErrorKind::BadRequest,
            "NotFoundException" => ApiErrorKind::NotFound,
            "UnauthorizedClientError" => ApiErrorKind::Unauthorized,
            "LimitExceededException" => ApiErrorKind::LimitExceeded,
            _ => ApiErrorKind::InternalService,
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl From<&LifecycleError> for ApiError {
    fn from(err: &LifecycleError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        ApiError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{validate, RawTopology};

    #[test]
    fn taxonomy_mapping() {
        let validation = validate(&RawTopology::default()).unwrap_err();
        assert_eq!(LifecycleError::from(validation).kind(), ApiErrorKind::BadRequest);
        assert_eq!(
            LifecycleError::Conflict {
                cluster: "c".into(),
                token: "t".into()
            }
            .kind(),
            ApiErrorKind::BadRequest
        );
        assert_eq!(LifecycleError::Busy("c".into()).kind(), ApiErrorKind::BadRequest);
        assert_eq!(
            LifecycleError::ReconcileInProgress("c".into()).kind(),
            ApiErrorKind::BadRequest
        );
        assert_eq!(LifecycleError::NotFound("c".into()).kind(), ApiErrorKind::NotFound);
        assert_eq!(
            LifecycleError::provider(ProviderError::api("VcpuLimitExceeded", "quota")).kind(),
            ApiErrorKind::LimitExceeded
        );
        assert_eq!(
            LifecycleError::provider(ProviderError::api("AccessDenied", "no")).kind(),
            ApiErrorKind::Unauthorized
        );
        assert_eq!(
            LifecycleError::provider(ProviderError::Transport("reset".into())).kind(),
            ApiErrorKind::InternalService
        );
        assert_eq!(
            LifecycleError::Snapshot(SnapshotError::Failed {
                class: ErrorClass::Unauthorized,
                error: ProviderError::api("AuthFailure", "bad creds"),
            })
            .kind(),
            ApiErrorKind::Unauthorized
        );
    }

    #[test]
    fn recorded_codes_round_trip() {
        for kind in [
            ApiErrorKind::InternalService,
            ApiErrorKind::BadRequest,
            ApiErrorKind::NotFound,
            ApiErrorKind::Unauthorized,
            ApiErrorKind::LimitExceeded,
        ] {
            assert_eq!(ApiErrorKind::from_code(kind.as_str()), kind);
        }
    }

    #[test]
    fn api_error_carries_message() {
        let api = ApiError::from(LifecycleError::NotFound("hpc".into()));
        assert_eq!(api.kind, ApiErrorKind::NotFound);
        assert_eq!(api.message, "cluster not found: hpc");
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["kind"], "NotFoundException");
    }
}
