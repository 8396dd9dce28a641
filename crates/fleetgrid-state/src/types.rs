//! Persisted records for the FleetGrid state store.

use std::fmt;

use fleet_core::Topology;
use serde::{Deserialize, Serialize};

// ── Cluster ───────────────────────────────────────────────────────

/// Lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    CreateInProgress,
    Active,
    UpdateInProgress,
    DeleteInProgress,
    CreateFailed,
    UpdateFailed,
    DeleteFailed,
    Deleted,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "PENDING",
            ClusterStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            ClusterStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            ClusterStatus::CreateFailed => "CREATE_FAILED",
            ClusterStatus::UpdateFailed => "UPDATE_FAILED",
            ClusterStatus::DeleteFailed => "DELETE_FAILED",
            ClusterStatus::Deleted => "DELETED",
        }
    }

    /// Parse the API form, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        const ALL: [ClusterStatus; 9] = [
            ClusterStatus::Pending,
            ClusterStatus::CreateInProgress,
            ClusterStatus::Active,
            ClusterStatus::UpdateInProgress,
            ClusterStatus::DeleteInProgress,
            ClusterStatus::CreateFailed,
            ClusterStatus::UpdateFailed,
            ClusterStatus::DeleteFailed,
            ClusterStatus::Deleted,
        ];
        ALL.into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
    }

    /// A lifecycle transition is running (or was interrupted mid-flight).
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ClusterStatus::CreateInProgress
                | ClusterStatus::UpdateInProgress
                | ClusterStatus::DeleteInProgress
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ClusterStatus::CreateFailed | ClusterStatus::UpdateFailed | ClusterStatus::DeleteFailed
        )
    }

    /// States in which a lifecycle transition has settled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClusterStatus::Active | ClusterStatus::Deleted) || self.is_failed()
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the cluster's compute fleet is allowed to run.
///
/// ```text
/// RUNNING → STOP_REQUESTED → STOPPING → STOPPED → START_REQUESTED → RUNNING
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeFleetStatus {
    #[default]
    Running,
    StopRequested,
    Stopping,
    Stopped,
    StartRequested,
}

impl ComputeFleetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeFleetStatus::Running => "RUNNING",
            ComputeFleetStatus::StopRequested => "STOP_REQUESTED",
            ComputeFleetStatus::Stopping => "STOPPING",
            ComputeFleetStatus::Stopped => "STOPPED",
            ComputeFleetStatus::StartRequested => "START_REQUESTED",
        }
    }

    /// Stopped or on its way there: ticks drain instead of scaling.
    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            ComputeFleetStatus::StopRequested | ComputeFleetStatus::Stopping | ComputeFleetStatus::Stopped
        )
    }
}

impl fmt::Display for ComputeFleetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRecord {
    pub name: String,
    pub status: ClusterStatus,
    /// Why the cluster is in a failed state, if it is.
    pub status_reason: Option<String>,
    /// Last-known-good topology. An UPDATE only replaces it on success.
    pub topology: Topology,
    /// Topology being applied while UPDATE_IN_PROGRESS.
    pub pending_topology: Option<Topology>,
    /// Token of the last accepted mutating request.
    pub last_token: Option<String>,
    /// Captured when a DELETE starts so a resumed delete honours it.
    pub retain_logs: bool,
    /// Unix timestamp (seconds) when the cluster was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
    #[serde(default)]
    pub compute_fleet: ComputeFleetStatus,
    /// Bumped each time the name is re-created after DELETED.
    #[serde(default)]
    pub incarnation: u64,
}

impl ClusterRecord {
    /// Build the key for the clusters table.
    pub fn table_key(&self) -> String {
        self.name.clone()
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            name: self.name.clone(),
            status: self.status,
            status_reason: self.status_reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// What lifecycle calls return to their caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSummary {
    pub name: String,
    pub status: ClusterStatus,
    pub status_reason: Option<String>,
    pub updated_at: u64,
}

// ── Idempotency ───────────────────────────────────────────────────

/// Mutating lifecycle operations that accept an idempotency token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOperation {
    Create,
    Update,
    Delete,
    StartFleet,
    StopFleet,
}

impl LifecycleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOperation::Create => "create",
            LifecycleOperation::Update => "update",
            LifecycleOperation::Delete => "delete",
            LifecycleOperation::StartFleet => "start_fleet",
            LifecycleOperation::StopFleet => "stop_fleet",
        }
    }
}

/// Result of a request, recorded once the transition settles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordedOutcome {
    Succeeded { summary: ClusterSummary },
    Failed { code: String, message: String },
}

/// An accepted request, keyed by (cluster, token).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub cluster: String,
    pub token: String,
    pub operation: LifecycleOperation,
    /// Digest of the operation and its payload.
    pub payload_digest: String,
    /// `None` while the transition is still running.
    pub outcome: Option<RecordedOutcome>,
    pub recorded_at: u64,
    /// Incarnation of the cluster the request was accepted against.
    #[serde(default)]
    pub incarnation: u64,
}

impl IdempotencyRecord {
    /// Build the composite key for the idempotency table.
    pub fn table_key(&self) -> String {
        idempotency_key(&self.cluster, &self.token)
    }
}

pub fn idempotency_key(cluster: &str, token: &str) -> String {
    format!("{cluster}:{token}")
}
