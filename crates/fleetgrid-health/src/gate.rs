//! Health gate — decides whether an instance counts as usable capacity.
//!
//! The gate is pure and total: it never fails. An instance that has not
//! reported a signal yet is [`GateVerdict::Pending`], which is not usable
//! but is not a replacement target either.

use fleet_core::{ComputeResource, HealthCheckKind, Queue};

use crate::signal::{HealthStatus, InstanceHealth};

/// Outcome of gating one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// Counts toward usable capacity.
    Usable,
    /// Some required signal is still unknown.
    Pending,
    /// Base status is unhealthy.
    Unhealthy,
    /// An enabled check reported unhealthy.
    FailedCheck(HealthCheckKind),
}

impl GateVerdict {
    pub fn is_usable(&self) -> bool {
        matches!(self, GateVerdict::Usable)
    }

    /// The instance is known to be broken and should be replaced.
    pub fn is_failed(&self) -> bool {
        matches!(self, GateVerdict::Unhealthy | GateVerdict::FailedCheck(_))
    }
}

/// Effective setting of one check for a compute resource.
///
/// Resource override, else queue default, else disabled.
pub fn effective_check(queue: &Queue, cr: &ComputeResource, kind: HealthCheckKind) -> bool {
    cr.health_checks
        .get(kind)
        .or_else(|| queue.health_checks.get(kind))
        .unwrap_or(false)
}

/// Every check kind enabled for a compute resource.
pub fn enabled_checks(queue: &Queue, cr: &ComputeResource) -> Vec<HealthCheckKind> {
    HealthCheckKind::ALL
        .iter()
        .copied()
        .filter(|kind| effective_check(queue, cr, *kind))
        .collect()
}

/// Gate an instance against its compute resource's effective checks.
pub fn evaluate(queue: &Queue, cr: &ComputeResource, health: &InstanceHealth) -> GateVerdict {
    match health.status {
        HealthStatus::Unhealthy => return GateVerdict::Unhealthy,
        HealthStatus::Unknown => return GateVerdict::Pending,
        HealthStatus::Healthy => {}
    }

    let mut pending = false;
    for kind in enabled_checks(queue, cr) {
        match health.check(kind) {
            HealthStatus::Healthy => {}
            HealthStatus::Unhealthy => return GateVerdict::FailedCheck(kind),
            HealthStatus::Unknown => pending = true,
        }
    }

    if pending {
        GateVerdict::Pending
    } else {
        GateVerdict::Usable
    }
}

/// Whether an instance counts as usable capacity.
pub fn is_usable(queue: &Queue, cr: &ComputeResource, health: &InstanceHealth) -> bool {
    evaluate(queue, cr, health).is_usable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{HealthChecks, ResourceKind};

    fn queue(gpu: Option<bool>) -> Queue {
        let mut checks = HealthChecks::new();
        if let Some(enabled) = gpu {
            checks.set(HealthCheckKind::Gpu, enabled);
        }
        Queue {
            name: "gpu".to_string(),
            subnet_ids: vec!["subnet-1".to_string()],
            health_checks: checks,
            scaling_strategy: None,
            compute_resources: vec![],
        }
    }

    fn resource(gpu: Option<bool>) -> ComputeResource {
        let mut checks = HealthChecks::new();
        if let Some(enabled) = gpu {
            checks.set(HealthCheckKind::Gpu, enabled);
        }
        ComputeResource {
            name: "p4d".to_string(),
            instance_types: vec!["p4d.24xlarge".to_string()],
            min_count: 0,
            max_count: 4,
            kind: ResourceKind::Dynamic,
            health_checks: checks,
        }
    }

    fn gpu_failing() -> InstanceHealth {
        InstanceHealth::healthy().with_check(HealthCheckKind::Gpu, HealthStatus::Unhealthy)
    }

    #[test]
    fn resource_without_override_inherits_queue() {
        assert!(effective_check(&queue(Some(true)), &resource(None), HealthCheckKind::Gpu));
        assert!(!effective_check(&queue(Some(false)), &resource(None), HealthCheckKind::Gpu));
    }

    #[test]
    fn nothing_declared_means_disabled() {
        assert!(!effective_check(&queue(None), &resource(None), HealthCheckKind::Gpu));
        assert!(enabled_checks(&queue(None), &resource(None)).is_empty());
    }

    #[test]
    fn resource_can_disable_a_queue_check() {
        let (q, cr) = (queue(Some(true)), resource(Some(false)));
        assert!(!effective_check(&q, &cr, HealthCheckKind::Gpu));
        // Never gated on GPU health.
        assert!(is_usable(&q, &cr, &gpu_failing()));
        assert!(is_usable(&q, &cr, &InstanceHealth::healthy()));
    }

    #[test]
    fn resource_can_enable_a_check_the_queue_disables() {
        let (q, cr) = (queue(Some(false)), resource(Some(true)));
        assert!(effective_check(&q, &cr, HealthCheckKind::Gpu));
        assert_eq!(evaluate(&q, &cr, &gpu_failing()), GateVerdict::FailedCheck(HealthCheckKind::Gpu));
        assert!(is_usable(&q, &cr, &InstanceHealth::fully_healthy()));
    }

    #[test]
    fn missing_signal_fails_closed() {
        let (q, cr) = (queue(None), resource(None));
        assert_eq!(evaluate(&q, &cr, &InstanceHealth::unknown()), GateVerdict::Pending);
        assert!(!is_usable(&q, &cr, &InstanceHealth::unknown()));

        // Enabled check with no observed result is pending too.
        let (q, cr) = (queue(Some(true)), resource(None));
        let verdict = evaluate(&q, &cr, &InstanceHealth::healthy());
        assert_eq!(verdict, GateVerdict::Pending);
        assert!(!verdict.is_failed());
    }

    #[test]
    fn unhealthy_base_status_wins() {
        let (q, cr) = (queue(None), resource(None));
        let verdict = evaluate(&q, &cr, &InstanceHealth::unhealthy());
        assert_eq!(verdict, GateVerdict::Unhealthy);
        assert!(verdict.is_failed());
    }
}
