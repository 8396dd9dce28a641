//! Cluster file and engine configuration parsing.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A cluster declaration as written on disk.
///
/// ```toml
/// name = "hpc-dev"
/// scaling_strategy = "all-or-nothing"
///
/// [[queues]]
/// name = "gpu"
/// subnet_ids = ["subnet-0a1b"]
/// health_checks.gpu.enabled = true
///
/// [[queues.compute_resources]]
/// name = "p4d"
/// instance_types = ["p4d.24xlarge"]
/// min_count = 0
/// max_count = 4
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterFile {
    pub name: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(flatten)]
    pub topology: RawTopology,
}

/// Unvalidated topology, straight from the file or an API payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawTopology {
    pub scaling_strategy: Option<String>,
    #[serde(default)]
    pub queues: Vec<RawQueue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawQueue {
    pub name: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    pub scaling_strategy: Option<String>,
    #[serde(default)]
    pub health_checks: BTreeMap<String, RawHealthCheck>,
    #[serde(default)]
    pub compute_resources: Vec<RawComputeResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawComputeResource {
    pub name: String,
    #[serde(default)]
    pub instance_types: Vec<String>,
    #[serde(default)]
    pub min_count: u32,
    #[serde(default = "default_max_count")]
    pub max_count: u32,
    /// "static" or "dynamic" (default).
    pub kind: Option<String>,
    #[serde(default)]
    pub health_checks: BTreeMap<String, RawHealthCheck>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RawHealthCheck {
    pub enabled: bool,
}

fn default_max_count() -> u32 {
    10
}

impl ClusterFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let file: ClusterFile = toml::from_str(content)?;
        Ok(file)
    }
}

// ── Engine ────────────────────────────────────────────────────────

/// Tunables for the reconciliation engine. Durations are strings such as
/// `"200ms"`, `"30s"`, `"10m"`; unparseable values fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval: String,
    /// Deadline applied to every fleet provider call.
    pub provider_timeout: String,
    pub snapshot_retry: RetryConfig,
    pub provider_retry: RetryConfig,
    pub capacity_backoff: BackoffConfig,
    /// How many times DELETE re-checks that nothing remains before failing.
    pub delete_verify_attempts: u32,
    /// How long an instance may report no health before it is replaced.
    pub pending_grace: String,
    /// How long a lifecycle request waits for an in-flight tick to finish.
    pub lock_wait: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial: String,
    pub max: String,
    pub multiplier: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: "60s".to_string(),
            provider_timeout: "30s".to_string(),
            snapshot_retry: RetryConfig {
                max_attempts: 3,
                base_delay: "200ms".to_string(),
            },
            provider_retry: RetryConfig::default(),
            capacity_backoff: BackoffConfig::default(),
            delete_verify_attempts: 5,
            pending_grace: "10m".to_string(),
            lock_wait: "60s".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: "1s".to_string(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: "30s".to_string(),
            max: "10m".to_string(),
            multiplier: 2,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn provider_timeout(&self) -> Duration {
        parse_duration(&self.provider_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn pending_grace(&self) -> Duration {
        parse_duration(&self.pending_grace).unwrap_or(Duration::from_secs(600))
    }

    pub fn lock_wait(&self) -> Duration {
        parse_duration(&self.lock_wait).unwrap_or(Duration::from_secs(60))
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        parse_duration(&self.base_delay).unwrap_or(Duration::from_secs(1))
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        parse_duration(&self.initial).unwrap_or(Duration::from_secs(30))
    }

    pub fn max(&self) -> Duration {
        parse_duration(&self.max).unwrap_or(Duration::from_secs(600))
    }
}

/// Parse a duration string like "250ms", "30s", "5m", "1h". A bare number
/// is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
