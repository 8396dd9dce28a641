//! Topology validation and normalization.
//!
//! [`validate`] is a pure function: it never touches the provider or the
//! store, and it reports every violation it finds in one pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::config::{RawComputeResource, RawHealthCheck, RawQueue, RawTopology};
use crate::types::*;

/// Cluster names: a leading letter, then letters, digits and hyphens, 60 max.
static CLUSTER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9-]{0,59}$").expect("static regex")
});

/// A single problem found in a declared topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error(
        "cluster name '{0}' must start with a letter, contain only alphanumerics and hyphens, \
         and be at most 60 characters"
    )]
    InvalidClusterName(String),

    #[error("topology declares no queues")]
    NoQueues,

    #[error("queue #{0} has an empty name")]
    EmptyQueueName(usize),

    #[error("queue '{0}' is declared more than once")]
    DuplicateQueue(String),

    #[error("queue '{0}' has no subnets")]
    NoSubnets(String),

    #[error("queue '{queue}' lists subnet ids more than once: {}", .subnets.join(", "))]
    DuplicateSubnets { queue: String, subnets: Vec<String> },

    #[error("queue '{0}' declares no compute resources")]
    NoComputeResources(String),

    #[error("compute resource #{index} in queue '{queue}' has an empty name")]
    EmptyComputeResourceName { queue: String, index: usize },

    #[error("compute resource '{name}' is declared more than once in queue '{queue}'")]
    DuplicateComputeResource { queue: String, name: String },

    #[error("compute resource '{key}' has no eligible instance types")]
    NoInstanceTypes { key: ResourceKey },

    #[error("compute resource '{key}' lists an empty instance type")]
    BlankInstanceType { key: ResourceKey },

    #[error("compute resource '{key}' lists instance types more than once: {}", .instance_types.join(", "))]
    DuplicateInstanceTypes {
        key: ResourceKey,
        instance_types: Vec<String>,
    },

    #[error("compute resource '{key}' has min_count {min} greater than max_count {max}")]
    MinExceedsMax { key: ResourceKey, min: u32, max: u32 },

    #[error("compute resource '{key}' has unknown kind '{value}' (expected static or dynamic)")]
    UnknownResourceKind { key: ResourceKey, value: String },

    #[error("{scope} references unknown health check '{name}'")]
    UnknownHealthCheck { scope: String, name: String },

    #[error("{scope} has unknown scaling strategy '{value}'")]
    UnknownScalingStrategy { scope: String, value: String },
}

/// Every violation found while validating a topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("topology has {} violation(s){}", .violations.len(), bulleted(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn bulleted(violations: &[Violation]) -> String {
    violations.iter().map(|v| format!("\n  - {v}")).collect()
}

impl ValidationError {
    pub fn contains(&self, violation: &Violation) -> bool {
        self.violations.contains(violation)
    }
}

/// Check a cluster name against the naming rules.
pub fn validate_cluster_name(name: &str) -> Result<(), Violation> {
    if CLUSTER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Violation::InvalidClusterName(name.to_string()))
    }
}

/// Validate and normalize a raw topology.
pub fn validate(raw: &RawTopology) -> Result<Topology, ValidationError> {
    let mut violations = Vec::new();
    let topology = check_topology(raw, &mut violations);
    if violations.is_empty() {
        Ok(topology)
    } else {
        Err(ValidationError { violations })
    }
}

/// Validate a cluster name together with its topology, reporting both.
pub fn validate_cluster(name: &str, raw: &RawTopology) -> Result<Topology, ValidationError> {
    let mut violations = Vec::new();
    if let Err(v) = validate_cluster_name(name) {
        violations.push(v);
    }
    let topology = check_topology(raw, &mut violations);
    if violations.is_empty() {
        Ok(topology)
    } else {
        Err(ValidationError { violations })
    }
}

fn check_topology(raw: &RawTopology, violations: &mut Vec<Violation>) -> Topology {
    let scaling_strategy = parse_strategy(raw.scaling_strategy.as_deref(), "topology", violations)
        .unwrap_or_default();

    if raw.queues.is_empty() {
        violations.push(Violation::NoQueues);
    }

    let mut seen = BTreeSet::new();
    let mut queues = Vec::with_capacity(raw.queues.len());
    for (index, raw_queue) in raw.queues.iter().enumerate() {
        if raw_queue.name.trim().is_empty() {
            violations.push(Violation::EmptyQueueName(index));
        } else if !seen.insert(raw_queue.name.as_str()) {
            violations.push(Violation::DuplicateQueue(raw_queue.name.clone()));
        }
        queues.push(check_queue(raw_queue, violations));
    }

    Topology {
        scaling_strategy,
        queues,
    }
}

fn check_queue(raw: &RawQueue, violations: &mut Vec<Violation>) -> Queue {
    let name = raw.name.clone();

    if raw.subnet_ids.is_empty() {
        violations.push(Violation::NoSubnets(name.clone()));
    }
    let duplicates = duplicates_of(&raw.subnet_ids);
    if !duplicates.is_empty() {
        violations.push(Violation::DuplicateSubnets {
            queue: name.clone(),
            subnets: duplicates,
        });
    }

    let scope = format!("queue '{name}'");
    let scaling_strategy = parse_strategy(raw.scaling_strategy.as_deref(), &scope, violations);
    let health_checks = check_health_checks(&raw.health_checks, &scope, violations);

    if raw.compute_resources.is_empty() {
        violations.push(Violation::NoComputeResources(name.clone()));
    }

    let mut seen = BTreeSet::new();
    let mut compute_resources = Vec::with_capacity(raw.compute_resources.len());
    for (index, raw_cr) in raw.compute_resources.iter().enumerate() {
        if raw_cr.name.trim().is_empty() {
            violations.push(Violation::EmptyComputeResourceName {
                queue: name.clone(),
                index,
            });
        } else if !seen.insert(raw_cr.name.as_str()) {
            violations.push(Violation::DuplicateComputeResource {
                queue: name.clone(),
                name: raw_cr.name.clone(),
            });
        }
        compute_resources.push(check_compute_resource(&name, raw_cr, violations));
    }

    Queue {
        name,
        subnet_ids: raw.subnet_ids.clone(),
        health_checks,
        scaling_strategy,
        compute_resources,
    }
}

fn check_compute_resource(
    queue: &str,
    raw: &RawComputeResource,
    violations: &mut Vec<Violation>,
) -> ComputeResource {
    let key = ResourceKey::new(queue, &raw.name);

    if raw.instance_types.is_empty() {
        violations.push(Violation::NoInstanceTypes { key: key.clone() });
    }
    if raw.instance_types.iter().any(|t| t.trim().is_empty()) {
        violations.push(Violation::BlankInstanceType { key: key.clone() });
    }
    let duplicates = duplicates_of(&raw.instance_types);
    if !duplicates.is_empty() {
        violations.push(Violation::DuplicateInstanceTypes {
            key: key.clone(),
            instance_types: duplicates,
        });
    }

    let kind = match raw.kind.as_deref() {
        None => ResourceKind::Dynamic,
        Some(value) => ResourceKind::parse(value).unwrap_or_else(|| {
            violations.push(Violation::UnknownResourceKind {
                key: key.clone(),
                value: value.to_string(),
            });
            ResourceKind::Dynamic
        }),
    };

    // Static pools always hold max_count; their declared min is irrelevant.
    let min_count = match kind {
        ResourceKind::Static => raw.max_count,
        ResourceKind::Dynamic => {
            if raw.min_count > raw.max_count {
                violations.push(Violation::MinExceedsMax {
                    key: key.clone(),
                    min: raw.min_count,
                    max: raw.max_count,
                });
            }
            raw.min_count
        }
    };

    let scope = format!("compute resource '{key}'");
    let health_checks = check_health_checks(&raw.health_checks, &scope, violations);

    ComputeResource {
        name: raw.name.clone(),
        instance_types: raw.instance_types.clone(),
        min_count,
        max_count: raw.max_count,
        kind,
        health_checks,
    }
}

fn check_health_checks(
    raw: &BTreeMap<String, RawHealthCheck>,
    scope: &str,
    violations: &mut Vec<Violation>,
) -> HealthChecks {
    let mut checks = HealthChecks::new();
    for (name, setting) in raw {
        match HealthCheckKind::parse(name) {
            Some(kind) => checks.set(kind, setting.enabled),
            None => violations.push(Violation::UnknownHealthCheck {
                scope: scope.to_string(),
                name: name.clone(),
            }),
        }
    }
    checks
}

fn parse_strategy(
    value: Option<&str>,
    scope: &str,
    violations: &mut Vec<Violation>,
) -> Option<ScalingStrategy> {
    let value = value?;
    let parsed = ScalingStrategy::parse(value);
    if parsed.is_none() {
        violations.push(Violation::UnknownScalingStrategy {
            scope: scope.to_string(),
            value: value.to_string(),
        });
    }
    parsed
}

/// Values appearing more than once, each reported once, in first-seen order.
fn duplicates_of(values: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut dupes = Vec::new();
    for v in values {
        if !seen.insert(v.as_str()) && !dupes.contains(v) {
            dupes.push(v.clone());
        }
    }
    dupes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_cr(name: &str, min: u32, max: u32) -> RawComputeResource {
        RawComputeResource {
            name: name.to_string(),
            instance_types: vec!["c5.xlarge".to_string()],
            min_count: min,
            max_count: max,
            kind: None,
            health_checks: BTreeMap::new(),
        }
    }

    fn raw_queue(name: &str, crs: Vec<RawComputeResource>) -> RawQueue {
        RawQueue {
            name: name.to_string(),
            subnet_ids: vec!["subnet-1".to_string()],
            scaling_strategy: None,
            health_checks: BTreeMap::new(),
            compute_resources: crs,
        }
    }

    fn raw_topology(queues: Vec<RawQueue>) -> RawTopology {
        RawTopology {
            scaling_strategy: None,
            queues,
        }
    }

    #[test]
    fn valid_topology_passes() {
        let raw = raw_topology(vec![
            raw_queue("compute", vec![raw_cr("cpu", 0, 10), raw_cr("mem", 1, 4)]),
            raw_queue("gpu", vec![raw_cr("p4d", 0, 2)]),
        ]);
        let topology = validate(&raw).unwrap();
        assert_eq!(topology.queues.len(), 2);
        assert_eq!(topology.scaling_strategy, ScalingStrategy::BestEffort);
        assert_eq!(topology.queues[0].compute_resources[1].min_count, 1);
    }

    #[test]
    fn reports_every_violation_not_just_the_first() {
        let mut bad_cr = raw_cr("cpu", 5, 2);
        bad_cr.instance_types.clear();
        let mut queue = raw_queue("compute", vec![bad_cr, raw_cr("cpu", 0, 1)]);
        queue.subnet_ids.clear();

        let err = validate(&raw_topology(vec![queue])).unwrap_err();
        let key = ResourceKey::new("compute", "cpu");

        assert!(err.contains(&Violation::NoSubnets("compute".to_string())));
        assert!(err.contains(&Violation::NoInstanceTypes { key: key.clone() }));
        assert!(err.contains(&Violation::MinExceedsMax { key, min: 5, max: 2 }));
        assert!(err.contains(&Violation::DuplicateComputeResource {
            queue: "compute".to_string(),
            name: "cpu".to_string(),
        }));
        assert_eq!(err.violations.len(), 4);
    }

    #[test]
    fn duplicate_queue_names_rejected() {
        let raw = raw_topology(vec![
            raw_queue("q", vec![raw_cr("a", 0, 1)]),
            raw_queue("q", vec![raw_cr("b", 0, 1)]),
        ]);
        let err = validate(&raw).unwrap_err();
        assert_eq!(err.violations, vec![Violation::DuplicateQueue("q".to_string())]);
    }

    #[test]
    fn same_resource_name_in_different_queues_is_fine() {
        let raw = raw_topology(vec![
            raw_queue("q1", vec![raw_cr("cr", 0, 1)]),
            raw_queue("q2", vec![raw_cr("cr", 0, 1)]),
        ]);
        assert!(validate(&raw).is_ok());
    }

    #[test]
    fn empty_topology_rejected() {
        let err = validate(&RawTopology::default()).unwrap_err();
        assert_eq!(err.violations, vec![Violation::NoQueues]);
    }

    #[test]
    fn duplicate_subnets_listed_once() {
        let mut queue = raw_queue("q", vec![raw_cr("cr", 0, 1)]);
        queue.subnet_ids = vec![
            "subnet-1".to_string(),
            "subnet-2".to_string(),
            "subnet-1".to_string(),
            "subnet-1".to_string(),
        ];
        let err = validate(&raw_topology(vec![queue])).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::DuplicateSubnets {
                queue: "q".to_string(),
                subnets: vec!["subnet-1".to_string()],
            }]
        );
    }

    #[test]
    fn unknown_health_check_rejected_at_both_levels() {
        let mut cr = raw_cr("cr", 0, 1);
        cr.health_checks
            .insert("disk".to_string(), RawHealthCheck { enabled: true });
        let mut queue = raw_queue("q", vec![cr]);
        queue
            .health_checks
            .insert("memory".to_string(), RawHealthCheck { enabled: false });
        queue
            .health_checks
            .insert("gpu".to_string(), RawHealthCheck { enabled: true });

        let err = validate(&raw_topology(vec![queue])).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.contains(&Violation::UnknownHealthCheck {
            scope: "queue 'q'".to_string(),
            name: "memory".to_string(),
        }));
        assert!(err.contains(&Violation::UnknownHealthCheck {
            scope: "compute resource 'q/cr'".to_string(),
            name: "disk".to_string(),
        }));
    }

    #[test]
    fn health_check_overrides_are_kept_per_level() {
        let mut cr = raw_cr("cr", 0, 1);
        cr.health_checks
            .insert("GPU".to_string(), RawHealthCheck { enabled: false });
        let mut queue = raw_queue("q", vec![cr]);
        queue
            .health_checks
            .insert("gpu".to_string(), RawHealthCheck { enabled: true });

        let topology = validate(&raw_topology(vec![queue])).unwrap();
        let queue = &topology.queues[0];
        assert_eq!(queue.health_checks.get(HealthCheckKind::Gpu), Some(true));
        assert_eq!(
            queue.compute_resources[0].health_checks.get(HealthCheckKind::Gpu),
            Some(false)
        );
    }

    #[test]
    fn static_resource_is_normalized_to_max() {
        let mut cr = raw_cr("fixed", 7, 3);
        cr.kind = Some("static".to_string());
        let topology = validate(&raw_topology(vec![raw_queue("q", vec![cr])])).unwrap();
        let cr = &topology.queues[0].compute_resources[0];
        assert!(cr.is_static());
        assert_eq!((cr.min_count, cr.max_count), (3, 3));
    }

    #[test]
    fn unknown_kind_and_strategy_rejected() {
        let mut cr = raw_cr("cr", 0, 1);
        cr.kind = Some("spot".to_string());
        let mut queue = raw_queue("q", vec![cr]);
        queue.scaling_strategy = Some("greedy".to_string());
        let mut raw = raw_topology(vec![queue]);
        raw.scaling_strategy = Some("all-or-nothing".to_string());

        let err = validate(&raw).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.contains(&Violation::UnknownScalingStrategy {
            scope: "queue 'q'".to_string(),
            value: "greedy".to_string(),
        }));
    }

    #[test]
    fn duplicate_and_blank_instance_types_rejected() {
        let mut cr = raw_cr("cr", 0, 1);
        cr.instance_types = vec![
            "c5.large".to_string(),
            " ".to_string(),
            "c5.large".to_string(),
        ];
        let err = validate(&raw_topology(vec![raw_queue("q", vec![cr])])).unwrap_err();
        assert_eq!(err.violations.len(), 2);
    }

    #[test]
    fn cluster_name_rules() {
        assert!(validate_cluster_name("hpc-dev-01").is_ok());
        assert!(validate_cluster_name("a").is_ok());
        assert!(validate_cluster_name("1cluster").is_err());
        assert!(validate_cluster_name("my_cluster").is_err());
        assert!(validate_cluster_name("").is_err());
        assert!(validate_cluster_name(&"a".repeat(60)).is_ok());
        assert!(validate_cluster_name(&"a".repeat(61)).is_err());
    }

    #[test]
    fn validate_cluster_reports_name_and_topology_together() {
        let err = validate_cluster("bad_name", &RawTopology::default()).unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                Violation::InvalidClusterName("bad_name".to_string()),
                Violation::NoQueues,
            ]
        );
    }

    #[test]
    fn display_lists_each_violation() {
        let err = validate(&RawTopology::default()).unwrap_err();
        let text = err.to_string();
        assert_eq!(text, "topology has 1 violation(s)\n  - topology declares no queues");

        let err = validate_cluster("bad_name", &RawTopology::default()).unwrap_err();
        let lines: Vec<_> = err.to_string().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "topology has 2 violation(s)");
        assert!(lines[1].starts_with("  - ") && lines[1].contains("bad_name"));
        assert_eq!(lines[2], "  - topology declares no queues");
    }

    #[test]
    fn validation_error_is_a_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(validate(&RawTopology::default()).unwrap_err());
        assert!(err.source().is_none());
        let any: anyhow::Error = validate(&RawTopology::default()).unwrap_err().into();
        assert!(any.to_string().starts_with("topology has 1 violation(s)"));
    }
}
