//! Health signals reported by the fleet provider for an instance.

use std::collections::BTreeMap;

use fleet_core::HealthCheckKind;
use serde::{Deserialize, Serialize};

/// Health status of an instance or of one check on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No signal observed yet.
    #[default]
    Unknown,
}

/// Everything the provider knows about an instance's health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHealth {
    /// Base status (instance reachable, status checks passing).
    pub status: HealthStatus,
    /// Results of individual health checks. Absent means not observed.
    #[serde(default)]
    pub checks: BTreeMap<HealthCheckKind, HealthStatus>,
}

impl InstanceHealth {
    /// No signal at all.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Healthy base status, no check results.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: BTreeMap::new(),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            checks: BTreeMap::new(),
        }
    }

    /// Healthy base status with every known check passing.
    pub fn fully_healthy() -> Self {
        HealthCheckKind::ALL
            .iter()
            .fold(Self::healthy(), |h, kind| h.with_check(*kind, HealthStatus::Healthy))
    }

    pub fn with_check(mut self, kind: HealthCheckKind, status: HealthStatus) -> Self {
        self.checks.insert(kind, status);
        self
    }

    /// Result of a single check; unobserved checks are `Unknown`.
    pub fn check(&self, kind: HealthCheckKind) -> HealthStatus {
        self.checks.get(&kind).copied().unwrap_or(HealthStatus::Unknown)
    }
}
