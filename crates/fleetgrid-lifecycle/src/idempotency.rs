//! Request deduplication keyed by (cluster, idempotency token).

use fleetgrid_state::*;
use tracing::debug;

use crate::error::{ApiErrorKind, LifecycleError, LifecycleResult};

/// Whether a mutating request should run.
#[derive(Debug)]
pub enum Admission {
    /// Run it. Carries the record to persist when a token was supplied.
    Fresh(Option<IdempotencyRecord>),
    /// Same token, same payload: answer with this instead of re-running.
    Replay(ClusterSummary),
}

/// Incarnation a request for `operation` runs against. CREATE over a
/// DELETED cluster starts the next one.
pub fn incarnation_for(current: Option<&ClusterRecord>, operation: LifecycleOperation) -> u64 {
    match current {
        Some(r) if r.status == ClusterStatus::Deleted && operation == LifecycleOperation::Create => {
            r.incarnation + 1
        }
        Some(r) => r.incarnation,
        None => 0,
    }
}

/// A recorded request no longer describes the cluster: the name was
/// re-created, or deleted after the request ran.
fn superseded(request: &IdempotencyRecord, current: &ClusterRecord) -> bool {
    request.incarnation != current.incarnation
        || (current.status == ClusterStatus::Deleted && request.operation != LifecycleOperation::Delete)
}

/// Check a request against previously accepted ones.
pub fn admit(
    store: &StateStore,
    cluster: &str,
    token: Option<&str>,
    operation: LifecycleOperation,
    digest: &str,
    now: u64,
) -> LifecycleResult<Admission> {
    let Some(token) = token else {
        return Ok(Admission::Fresh(None));
    };

    let current = store.get_cluster(cluster)?;
    let Some(existing) = store.get_request(cluster, token)? else {
        return Ok(Admission::Fresh(Some(IdempotencyRecord {
            cluster: cluster.to_string(),
            token: token.to_string(),
            operation,
            payload_digest: digest.to_string(),
            outcome: None,
            recorded_at: now,
            incarnation: incarnation_for(current.as_ref(), operation),
        })));
    };

    let stale = current.as_ref().is_some_and(|record| superseded(&existing, record));
    if existing.operation != operation || existing.payload_digest != digest || stale {
        if stale {
            debug!(%cluster, %token, "token belongs to an earlier incarnation of the cluster");
        }
        return Err(LifecycleError::Conflict {
            cluster: cluster.to_string(),
            token: token.to_string(),
        });
    }

    debug!(%cluster, %token, operation = operation.as_str(), "replaying request");
    match existing.outcome {
        Some(RecordedOutcome::Succeeded { summary }) => Ok(Admission::Replay(summary)),
        Some(RecordedOutcome::Failed { code, message }) => Err(LifecycleError::Replayed {
            kind: ApiErrorKind::from_code(&code),
            message,
        }),
        // Still running: report where it is now.
        None => match current {
            Some(record) => Ok(Admission::Replay(record.summary())),
            None => Err(LifecycleError::NotFound(cluster.to_string())),
        },
    }
}

/// Record the final outcome of an accepted request.
pub fn settle(
    store: &StateStore,
    request: Option<IdempotencyRecord>,
    outcome: RecordedOutcome,
) -> LifecycleResult<()> {
    if let Some(mut request) = request {
        request.outcome = Some(outcome);
        store.put_request(&request)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: ClusterStatus) -> ClusterSummary {
        ClusterSummary {
            name: "hpc".to_string(),
            status,
            status_reason: None,
            updated_at: 1,
        }
    }

    fn fresh(store: &StateStore, token: &str, op: LifecycleOperation, digest: &str) -> IdempotencyRecord {
        match admit(store, "hpc", Some(token), op, digest, 1).unwrap() {
            Admission::Fresh(Some(record)) => record,
            other => panic!("expected fresh admission, got {other:?}"),
        }
    }

    #[test]
    fn no_token_always_runs() {
        let store = StateStore::open_in_memory().unwrap();
        let admission = admit(&store, "hpc", None, LifecycleOperation::Delete, "d", 1).unwrap();
        assert!(matches!(admission, Admission::Fresh(None)));
    }

    #[test]
    fn settled_success_is_replayed() {
        let store = StateStore::open_in_memory().unwrap();
        let record = fresh(&store, "t1", LifecycleOperation::Delete, "d");
        settle(
            &store,
            Some(record),
            RecordedOutcome::Succeeded {
                summary: summary(ClusterStatus::Deleted),
            },
        )
        .unwrap();

        match admit(&store, "hpc", Some("t1"), LifecycleOperation::Delete, "d", 2).unwrap() {
            Admission::Replay(s) => assert_eq!(s.status, ClusterStatus::Deleted),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn settled_failure_is_replayed_as_error() {
        let store = StateStore::open_in_memory().unwrap();
        let record = fresh(&store, "t1", LifecycleOperation::Create, "d");
        settle(
            &store,
            Some(record),
            RecordedOutcome::Failed {
                code: "LimitExceededException".to_string(),
                message: "quota".to_string(),
            },
        )
        .unwrap();

        let err = admit(&store, "hpc", Some("t1"), LifecycleOperation::Create, "d", 2).unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::LimitExceeded);
        assert_eq!(err.to_string(), "quota");
    }

    #[test]
    fn different_payload_or_operation_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let record = fresh(&store, "t1", LifecycleOperation::Create, "d1");
        store.put_request(&record).unwrap();

        let err = admit(&store, "hpc", Some("t1"), LifecycleOperation::Create, "d2", 2).unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict { .. }));
        let err = admit(&store, "hpc", Some("t1"), LifecycleOperation::Delete, "d1", 2).unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict { .. }));
    }

    fn cluster(status: ClusterStatus, incarnation: u64) -> ClusterRecord {
        ClusterRecord {
            name: "hpc".to_string(),
            status,
            status_reason: None,
            topology: fleet_core::Topology {
                scaling_strategy: fleet_core::ScalingStrategy::BestEffort,
                queues: vec![],
            },
            pending_topology: None,
            last_token: None,
            retain_logs: true,
            created_at: 1,
            updated_at: 1,
            compute_fleet: ComputeFleetStatus::Running,
            incarnation,
        }
    }

    fn settled_create(store: &StateStore, token: &str) {
        let record = fresh(store, token, LifecycleOperation::Create, "d");
        settle(
            store,
            Some(record),
            RecordedOutcome::Succeeded {
                summary: summary(ClusterStatus::Active),
            },
        )
        .unwrap();
    }

    #[test]
    fn create_token_is_stale_once_the_cluster_is_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        settled_create(&store, "t1");
        store.put_cluster(&cluster(ClusterStatus::Deleted, 0)).unwrap();

        let err = admit(&store, "hpc", Some("t1"), LifecycleOperation::Create, "d", 5).unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict { .. }));
    }

    #[test]
    fn create_token_is_stale_after_the_name_is_recreated() {
        let store = StateStore::open_in_memory().unwrap();
        settled_create(&store, "t1");
        store.put_cluster(&cluster(ClusterStatus::Active, 1)).unwrap();

        let err = admit(&store, "hpc", Some("t1"), LifecycleOperation::Create, "d", 5).unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict { .. }));
    }

    #[test]
    fn delete_token_still_replays_after_deletion() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&cluster(ClusterStatus::Active, 0)).unwrap();
        let record = fresh(&store, "d1", LifecycleOperation::Delete, "d");
        settle(
            &store,
            Some(record),
            RecordedOutcome::Succeeded {
                summary: summary(ClusterStatus::Deleted),
            },
        )
        .unwrap();
        store.put_cluster(&cluster(ClusterStatus::Deleted, 0)).unwrap();

        let admission = admit(&store, "hpc", Some("d1"), LifecycleOperation::Delete, "d", 5).unwrap();
        assert!(matches!(admission, Admission::Replay(s) if s.status == ClusterStatus::Deleted));
    }

    #[test]
    fn create_over_deleted_starts_next_incarnation() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(fresh(&store, "t1", LifecycleOperation::Create, "d").incarnation, 0);

        store.put_cluster(&cluster(ClusterStatus::Deleted, 3)).unwrap();
        assert_eq!(fresh(&store, "t2", LifecycleOperation::Create, "d").incarnation, 4);
        assert_eq!(fresh(&store, "t3", LifecycleOperation::Delete, "d").incarnation, 3);
    }

    #[test]
    fn tokens_are_scoped_per_cluster() {
        let store = StateStore::open_in_memory().unwrap();
        let record = fresh(&store, "t1", LifecycleOperation::Create, "d1");
        store.put_request(&record).unwrap();

        let admission = admit(&store, "other", Some("t1"), LifecycleOperation::Create, "d2", 2).unwrap();
        assert!(matches!(admission, Admission::Fresh(Some(_))));
    }
}
