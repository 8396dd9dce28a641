//! Capacity backoff — throttles launches for capacity-constrained resources.
//!
//! After the n-th consecutive CapacityConstrained launch a compute resource
//! is held back for `min(initial × multiplier^(n-1), max)`. The first fully
//! successful launch clears it.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use fleet_core::config::BackoffConfig;
use fleet_core::ResourceKey;
use tracing::{debug, info};

/// Per-resource backoff state.
#[derive(Debug, Clone)]
struct BackoffState {
    consecutive_failures: u32,
    current_delay: Duration,
    retry_at: Instant,
}

/// Backoff registry for every (cluster, compute resource) pair.
#[derive(Debug)]
pub struct CapacityBackoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    states: HashMap<(String, ResourceKey), BackoffState>,
}

impl CapacityBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1),
            states: HashMap::new(),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial(), config.max(), config.multiplier)
    }

    /// Record a capacity-constrained launch and return the new delay.
    pub fn record_constrained(&mut self, cluster: &str, key: &ResourceKey, now: Instant) -> Duration {
        let (initial, max, multiplier) = (self.initial, self.max, self.multiplier);
        let state = self
            .states
            .entry((cluster.to_string(), key.clone()))
            .or_insert_with(|| BackoffState {
                consecutive_failures: 0,
                current_delay: Duration::ZERO,
                retry_at: now,
            });

        state.consecutive_failures += 1;
        state.current_delay = if state.consecutive_failures == 1 {
            initial.min(max)
        } else {
            state.current_delay.saturating_mul(multiplier).min(max)
        };
        state.retry_at = now + state.current_delay;

        debug!(
            %cluster,
            resource = %key,
            failures = state.consecutive_failures,
            delay = ?state.current_delay,
            "capacity backoff extended"
        );
        state.current_delay
    }

    /// Clear backoff after a fully successful launch.
    pub fn record_success(&mut self, cluster: &str, key: &ResourceKey) {
        if self.states.remove(&(cluster.to_string(), key.clone())).is_some() {
            info!(%cluster, resource = %key, "capacity recovered, backoff cleared");
        }
    }

    /// Whether launches for the resource are currently held back.
    pub fn is_throttled(&self, cluster: &str, key: &ResourceKey, now: Instant) -> bool {
        self.states
            .get(&(cluster.to_string(), key.clone()))
            .is_some_and(|s| now < s.retry_at)
    }

    /// Resources of a cluster whose launches are held back at `now`.
    pub fn throttled(&self, cluster: &str, now: Instant) -> BTreeSet<ResourceKey> {
        self.states
            .iter()
            .filter(|((c, _), s)| c == cluster && now < s.retry_at)
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    /// Resources of a cluster that have hit capacity and not yet recovered.
    pub fn constrained(&self, cluster: &str) -> BTreeSet<ResourceKey> {
        self.states
            .keys()
            .filter(|(c, _)| c == cluster)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn consecutive_failures(&self, cluster: &str, key: &ResourceKey) -> u32 {
        self.states
            .get(&(cluster.to_string(), key.clone()))
            .map_or(0, |s| s.consecutive_failures)
    }

    /// Forget everything about a cluster (after delete).
    pub fn clear_cluster(&mut self, cluster: &str) {
        self.states.retain(|(c, _), _| c != cluster);
    }
}
