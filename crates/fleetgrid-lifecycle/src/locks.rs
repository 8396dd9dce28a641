//! Per-cluster mutual exclusion.
//!
//! Lifecycle transitions and reconciliation ticks for the same cluster
//! never overlap. Different clusters never contend. Lifecycle requests
//! have priority: one that finds a tick in flight waits for it to finish,
//! one that finds another transition is turned away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// What holds a cluster's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Lifecycle,
    Tick,
}

/// Why a lifecycle transition could not take the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// Another transition holds the cluster or is already queued for it.
    Lifecycle,
    /// A tick kept the cluster past the wait bound.
    TickTimeout,
}

#[derive(Default)]
struct SlotState {
    holder: Option<Holder>,
    lifecycle_waiting: bool,
}

#[derive(Default)]
struct Slot {
    lock: Arc<Mutex<()>>,
    state: StdMutex<SlotState>,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held cluster lock. Released on drop.
pub struct ClusterGuard {
    slot: Arc<Slot>,
    _guard: OwnedMutexGuard<()>,
}

impl ClusterGuard {
    fn new(slot: Arc<Slot>, guard: OwnedMutexGuard<()>, holder: Holder) -> Self {
        slot.state().holder = Some(holder);
        Self {
            slot,
            _guard: guard,
        }
    }
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        self.slot.state().holder = None;
    }
}

/// Clears the queued-transition mark even if the waiting request is dropped.
struct Queued(Arc<Slot>);

impl Drop for Queued {
    fn drop(&mut self) {
        self.0.state().lifecycle_waiting = false;
    }
}

/// Lock registry: cluster name → slot.
#[derive(Clone, Default)]
pub struct ClusterLocks {
    slots: Arc<Mutex<HashMap<String, Arc<Slot>>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, cluster: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        slots.entry(cluster.to_string()).or_default().clone()
    }

    /// Take the cluster's lock if nobody holds it.
    pub async fn try_acquire(&self, cluster: &str, holder: Holder) -> Option<ClusterGuard> {
        let slot = self.slot(cluster).await;
        let guard = Arc::clone(&slot.lock).try_lock_owned().ok()?;
        Some(ClusterGuard::new(slot, guard, holder))
    }

    /// Wait for the cluster's lock.
    pub async fn acquire(&self, cluster: &str, holder: Holder) -> ClusterGuard {
        let slot = self.slot(cluster).await;
        let guard = Arc::clone(&slot.lock).lock_owned().await;
        ClusterGuard::new(slot, guard, holder)
    }

    /// Lock the cluster for a lifecycle transition, waiting up to `wait`
    /// behind an in-flight tick but never behind another transition.
    pub async fn acquire_for_lifecycle(
        &self,
        cluster: &str,
        wait: Duration,
    ) -> Result<ClusterGuard, Contention> {
        let slot = self.slot(cluster).await;
        {
            let mut state = slot.state();
            if let Ok(guard) = Arc::clone(&slot.lock).try_lock_owned() {
                state.holder = Some(Holder::Lifecycle);
                drop(state);
                return Ok(ClusterGuard {
                    slot,
                    _guard: guard,
                });
            }
            if state.holder == Some(Holder::Lifecycle) || state.lifecycle_waiting {
                return Err(Contention::Lifecycle);
            }
            state.lifecycle_waiting = true;
        }

        let queued = Queued(Arc::clone(&slot));
        let acquired = tokio::time::timeout(wait, Arc::clone(&slot.lock).lock_owned()).await;
        drop(queued);
        match acquired {
            Ok(guard) => Ok(ClusterGuard::new(slot, guard, Holder::Lifecycle)),
            Err(_) => Err(Contention::TickTimeout),
        }
    }

    /// Forget a cluster's slot once nothing holds or waits on it.
    pub async fn prune(&self, cluster: &str) {
        let mut slots = self.slots.lock().await;
        if slots.get(cluster).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(cluster);
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}
