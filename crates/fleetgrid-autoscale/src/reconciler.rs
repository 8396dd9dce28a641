//! Scaling reconciler — turns desired-vs-actual capacity into a plan.

use std::collections::BTreeSet;
use std::time::Duration;

use fleet_core::{ComputeResource, Queue, ResourceKey, ScalingStrategy, Topology};
use fleetgrid_health::{evaluate, GateVerdict};
use fleetgrid_provider::{Instance, Snapshot};
use tracing::{debug, warn};

use crate::demand::Demand;
use crate::plan::*;

/// Boot deadline for instances that have not reported health yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootWindow {
    /// Planning time, seconds since the epoch.
    pub now: u64,
    pub grace: Duration,
}

impl BootWindow {
    pub fn new(now: u64, grace: Duration) -> Self {
        Self { now, grace }
    }

    /// True once an instance launched at `launched_at` has outlived the grace.
    pub fn expired(&self, launched_at: u64) -> bool {
        self.now.saturating_sub(launched_at) > self.grace.as_secs()
    }
}

/// Plan one tick for a cluster.
///
/// `throttled` holds the compute resources whose launches are currently
/// held back by capacity backoff. Instances still without a health signal
/// once `boot` has expired are replaced as unhealthy.
pub fn reconcile(
    topology: &Topology,
    snapshot: &Snapshot,
    demand: &Demand,
    throttled: &BTreeSet<ResourceKey>,
    boot: BootWindow,
) -> ScalingPlan {
    let queues = topology
        .queues
        .iter()
        .map(|queue| plan_queue(topology, queue, snapshot, demand, throttled, boot))
        .collect();

    let orphans = snapshot
        .orphans
        .iter()
        .map(|i| Termination {
            instance: i.id.clone(),
            reason: TerminationReason::Orphaned,
        })
        .collect::<Vec<_>>();
    if !orphans.is_empty() {
        debug!(cluster = %snapshot.cluster, count = orphans.len(), "terminating orphaned instances");
    }

    ScalingPlan {
        cluster: snapshot.cluster.clone(),
        queues,
        orphans,
    }
}

fn plan_queue(
    topology: &Topology,
    queue: &Queue,
    snapshot: &Snapshot,
    demand: &Demand,
    throttled: &BTreeSet<ResourceKey>,
    boot: BootWindow,
) -> QueuePlan {
    let strategy = topology.strategy_for(queue);
    let mut resources = Vec::with_capacity(queue.compute_resources.len());
    let mut blocked_by = None;

    for cr in &queue.compute_resources {
        let key = queue.key_for(cr);
        let mut plan = plan_resource(queue, cr, snapshot.instances(&key), demand.get(&key), boot);

        if throttled.contains(&key) {
            if plan.launch > 0 {
                debug!(
                    cluster = %snapshot.cluster,
                    resource = %key,
                    suppressed = plan.launch,
                    "launches throttled by capacity backoff"
                );
                plan.launch = 0;
                blocked_by.get_or_insert_with(|| key.clone());
            }
            plan.annotations.push(Annotation::Throttled);
        }
        resources.push(plan);
    }

    if let (ScalingStrategy::AllOrNothing, Some(blocked_by)) = (strategy, blocked_by) {
        for plan in resources.iter_mut().filter(|p| p.launch > 0) {
            debug!(
                cluster = %snapshot.cluster,
                resource = %plan.key,
                %blocked_by,
                "launch deferred by all-or-nothing queue"
            );
            plan.launch = 0;
            plan.annotations.push(Annotation::Deferred {
                blocked_by: blocked_by.clone(),
            });
        }
    }

    QueuePlan {
        name: queue.name.clone(),
        strategy,
        resources,
    }
}

fn plan_resource(
    queue: &Queue,
    cr: &ComputeResource,
    instances: &[Instance],
    demand: Option<u32>,
    boot: BootWindow,
) -> ResourcePlan {
    let key = queue.key_for(cr);
    let mut terminate = Vec::new();
    let mut kept: Vec<&Instance> = Vec::new();
    let mut usable = 0u32;

    for instance in instances {
        let reason = if instance.is_orphaned() {
            Some(TerminationReason::Orphaned)
        } else if instance.capacity_error {
            Some(TerminationReason::CapacityError)
        } else {
            match evaluate(queue, cr, &instance.health) {
                GateVerdict::Usable => {
                    usable += 1;
                    None
                }
                GateVerdict::Pending if boot.expired(instance.launched_at) => {
                    warn!(
                        resource = %key,
                        instance = %instance.id,
                        launched_at = instance.launched_at,
                        "no health signal within boot grace; replacing"
                    );
                    Some(TerminationReason::Unhealthy)
                }
                GateVerdict::Pending => None,
                GateVerdict::Unhealthy | GateVerdict::FailedCheck(_) => {
                    Some(TerminationReason::Unhealthy)
                }
            }
        };
        match reason {
            Some(reason) => terminate.push(Termination {
                instance: instance.id.clone(),
                reason,
            }),
            None => kept.push(instance),
        }
    }
    terminate.sort_by_key(|t| t.reason);

    let total = instances.len() as u32;
    let kept_count = kept.len() as u32;
    let pending = kept_count - usable;
    let mut annotations = Vec::new();

    let desired = if cr.is_static() {
        cr.max_count
    } else {
        demand.unwrap_or(0).clamp(cr.min_count, cr.max_count)
    };
    let launch = desired.saturating_sub(kept_count);

    if kept_count > desired {
        let excess = kept_count - desired;
        if cr.is_static() {
            warn!(
                resource = %key,
                desired,
                running = kept_count,
                "static compute resource over capacity; leaving healthy instances running"
            );
            annotations.push(Annotation::Overcapacity { excess });
        } else {
            // Longest idle first, then oldest.
            kept.sort_by(|a, b| {
                b.idle_secs
                    .cmp(&a.idle_secs)
                    .then(a.launched_at.cmp(&b.launched_at))
                    .then(a.id.cmp(&b.id))
            });
            terminate.extend(kept.iter().take(excess as usize).map(|i| Termination {
                instance: i.id.clone(),
                reason: TerminationReason::ScaleDown,
            }));
        }
    }

    if launch > 0 || !terminate.is_empty() {
        debug!(
            resource = %key,
            desired,
            total,
            usable,
            pending,
            launch,
            terminate = terminate.len(),
            "compute resource out of balance"
        );
    }

    ResourcePlan {
        key,
        kind: cr.kind,
        desired,
        total,
        usable,
        pending,
        launch,
        terminate,
        annotations,
    }
}
