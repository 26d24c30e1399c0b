//! Test suite for ensuring a correct implementation of a backend.
use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::job::{query::Where, FailureKind};

const DEFAULT_QUEUE: &str = "default";
const DEFAULT_JOB_TYPE: &str = "email.send";
const LEASE: TimeDelta = TimeDelta::minutes(5);
const DELTA: TimeDelta = TimeDelta::milliseconds(1);

impl EnqueuableJob {
    pub(crate) fn mock_job() -> Self {
        Self {
            max_attempts: 5,
            ..Self::new(DEFAULT_QUEUE, DEFAULT_JOB_TYPE, json!({"to": "a@b.com"}))
        }
    }
}

#[cfg(test)]
impl Job {
    pub(crate) fn raw_job() -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue_name: DEFAULT_QUEUE.to_owned(),
            job_type: DEFAULT_JOB_TYPE.to_owned(),
            payload: Document::new(),
            result: None,
            error_message: None,
            error_kind: None,
            priority: 0,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: 3,
            worker_id: None,
            locked_at: None,
            locked_until: None,
            scheduled_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            organization_id: None,
            user_id: None,
            timeout_seconds: None,
            metadata: Document::new(),
        }
    }
}

fn queues() -> Vec<String> {
    vec![DEFAULT_QUEUE.to_owned()]
}

fn assert_close(left: DateTime<Utc>, right: DateTime<Utc>) {
    assert!(
        (left - right).abs() <= DELTA,
        "{left} is not within {DELTA} of {right}"
    );
}

async fn claim_next(backend: &impl Backend) -> Option<Job> {
    backend.claim("worker-1", &queues(), LEASE).await.unwrap()
}

async fn get(backend: &impl Backend, id: JobId) -> Job {
    backend.get_job(id).await.unwrap().unwrap()
}

/// Create test suite for a backend.
///
/// For backend implementors, it is useful to include this are part of your test suites.
///
/// # Example
///
/// ```
/// use jobqueue::test_suite;
/// use jobqueue::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you using a different async test attribute you can configure the marco to use that instead.
/// Extra attributes, such as `ignore`, can be applied to every generated test with `extra:`.
/// For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use jobqueue::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     extra: ignore,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, $(extra: $extra:meta,)? args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(
            @tests [$attr $(, $extra)?] $args $backend;
            enqueue,
            enqueue_rejects_invalid_jobs,
            enqueue_stores_all_fields,
            claim_empty,
            claim_only_requested_queues,
            claim_by_priority_then_schedule,
            claim_skips_future_jobs,
            claim_leases_job,
            claim_reclaims_expired_lease,
            claim_keeps_active_lease,
            claim_is_exclusive,
            mark_job_complete,
            mark_job_complete_after_cancel,
            mark_job_complete_not_found,
            mark_job_failed,
            mark_job_failed_from_pending,
            mark_job_failed_not_found,
            mark_job_retryable,
            mark_job_retryable_exhausted,
            mark_job_retryable_not_found,
            mark_job_cancelled,
            mark_job_cancelled_processing,
            mark_job_cancelled_completed,
            mark_job_cancelled_not_found,
            queue_stats,
            query
        );
    };
    (@tests $attrs:tt $args:tt $backend:expr; $($name:ident),*) => {
        $(
            $crate::test_suite!(@test $attrs $args $backend; $name);
        )*
    };
    (@test [$($attr:meta),*] $args:tt $backend:expr; $name:ident) => {
        $(#[$attr])*
        async fn $name $args {
            let backend = $backend;
            $crate::backend::testing::$name(backend).await;
        }
    };
}

pub use test_suite;

#[doc(hidden)]
pub async fn enqueue(backend: impl Backend) {
    let before = Utc::now();
    let id1 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_ne!(id1, id2);

    let job = get(&backend, id1).await;
    assert_eq!(job.id, id1);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.max_attempts, 5);
    assert!(job.worker_id.is_none());
    assert!(job.locked_until.is_none());
    assert!(job.started_at.is_none());
    assert!(job.created_at >= before - DELTA);
}

#[doc(hidden)]
pub async fn enqueue_rejects_invalid_jobs(backend: impl Backend) {
    let result = backend
        .enqueue(EnqueuableJob {
            payload: json!([1, 2, 3]),
            ..EnqueuableJob::mock_job()
        })
        .await;
    assert!(matches!(
        result,
        Err(BackendError::Validation(ValidationError::MalformedPayload(
            _
        )))
    ));

    let result = backend
        .enqueue(EnqueuableJob::mock_job().with_queue(""))
        .await;
    assert!(matches!(
        result,
        Err(BackendError::Validation(ValidationError::MissingQueueName))
    ));

    let result = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(0))
        .await;
    assert!(matches!(
        result,
        Err(BackendError::Validation(ValidationError::InvalidMaxAttempts))
    ));

    assert!(backend.query(Query::And(vec![])).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn enqueue_stores_all_fields(backend: impl Backend) {
    let organization_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let scheduled_at = Utc::now() + TimeDelta::hours(1);
    let payload = json!({"to": "a@b.com", "cc": ["c@d.com"], "retries": {"count": 2}});
    let metadata = json!({"source": "signup"});

    let id = backend
        .enqueue(EnqueuableJob {
            payload: payload.clone(),
            metadata: metadata.clone(),
            organization_id: Some(organization_id),
            user_id: Some(user_id),
            timeout_seconds: Some(30),
            ..EnqueuableJob::mock_job()
                .with_queue("critical")
                .with_job_type("user.welcome")
                .with_priority(9)
                .with_scheduled_at(scheduled_at)
        })
        .await
        .unwrap();

    let job = get(&backend, id).await;
    assert_eq!(job.queue_name, "critical");
    assert_eq!(job.job_type, "user.welcome");
    assert_eq!(job.priority, 9);
    assert_eq!(Value::Object(job.payload), payload);
    assert_eq!(Value::Object(job.metadata), metadata);
    assert_eq!(job.organization_id, Some(organization_id));
    assert_eq!(job.user_id, Some(user_id));
    assert_eq!(job.timeout_seconds, Some(30));
    assert_close(job.scheduled_at, scheduled_at);
}

#[doc(hidden)]
pub async fn claim_empty(backend: impl Backend) {
    assert!(claim_next(&backend).await.is_none());
}

#[doc(hidden)]
pub async fn claim_only_requested_queues(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue("low"))
        .await
        .unwrap();
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_queue("critical"))
        .await
        .unwrap();

    assert!(claim_next(&backend).await.is_none());

    let job = backend
        .claim("worker-1", &["critical".to_owned()], LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
}

#[doc(hidden)]
pub async fn claim_by_priority_then_schedule(backend: impl Backend) {
    let now = Utc::now();
    let id1 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(now - TimeDelta::seconds(10)))
        .await
        .unwrap();
    let id2 = backend
        .enqueue(
            EnqueuableJob::mock_job()
                .with_priority(5)
                .with_scheduled_at(now - TimeDelta::seconds(1)),
        )
        .await
        .unwrap();
    let id3 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(now - TimeDelta::seconds(20)))
        .await
        .unwrap();

    let mut claimed = vec![];
    while let Some(job) = claim_next(&backend).await {
        claimed.push(job.id);
    }
    assert_eq!(claimed, [id2, id3, id1]);
}

#[doc(hidden)]
pub async fn claim_skips_future_jobs(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();

    assert!(claim_next(&backend).await.is_none());
}

#[doc(hidden)]
pub async fn claim_leases_job(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let before = Utc::now();
    let job = backend
        .claim("worker-7", &queues(), TimeDelta::minutes(2))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("worker-7"));
    assert_eq!(job.attempt_count, 0);
    let locked_at = job.locked_at.unwrap();
    assert!(locked_at >= before - TimeDelta::seconds(1));
    assert_close(job.locked_until.unwrap(), locked_at + TimeDelta::minutes(2));
    assert!(job.started_at.is_some());
    assert_eq!(get(&backend, id).await.status, JobStatus::Processing);
}

#[doc(hidden)]
pub async fn claim_reclaims_expired_lease(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend
        .claim("worker-1", &queues(), TimeDelta::milliseconds(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let job = backend
        .claim("worker-2", &queues(), LEASE)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.id, id);
    assert_eq!(job.worker_id.as_deref(), Some("worker-2"));
    assert_eq!(job.attempt_count, 0);
}

#[doc(hidden)]
pub async fn claim_keeps_active_lease(backend: impl Backend) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim_next(&backend).await.unwrap();

    assert!(backend
        .claim("worker-2", &queues(), LEASE)
        .await
        .unwrap()
        .is_none());
}

#[doc(hidden)]
pub async fn claim_is_exclusive(backend: impl Backend) {
    let mut enqueued = HashSet::new();
    for _ in 0..5 {
        enqueued.insert(backend.enqueue(EnqueuableJob::mock_job()).await.unwrap());
    }

    let worker_ids: Vec<String> = (0..10).map(|i| format!("worker-{i}")).collect();
    let queue_names = queues();
    let results = futures::future::join_all(
        worker_ids
            .iter()
            .map(|worker_id| backend.claim(worker_id, &queue_names, LEASE)),
    )
    .await;

    let mut claimed = vec![];
    for result in results {
        if let Some(job) = result.unwrap() {
            claimed.push(job.id);
        }
    }
    while let Some(job) = claim_next(&backend).await {
        claimed.push(job.id);
    }

    let unique: HashSet<JobId> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 5);
    assert_eq!(unique, enqueued);
}

#[doc(hidden)]
pub async fn mark_job_complete(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim_next(&backend).await.unwrap();

    let mut result = Document::new();
    result.insert("duration_ms".to_owned(), json!(12));
    let transition = backend.mark_job_complete(id, result.clone()).await.unwrap();

    assert_eq!(transition, Transition::Applied);
    let job = get(&backend, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(result));
    assert!(job.completed_at.is_some());
    assert!(job.worker_id.is_none());
    assert!(job.locked_until.is_none());
}

#[doc(hidden)]
pub async fn mark_job_complete_after_cancel(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim_next(&backend).await.unwrap();
    backend.mark_job_cancelled(id).await.unwrap();

    let transition = backend
        .mark_job_complete(id, Document::new())
        .await
        .unwrap();

    assert_eq!(
        transition,
        Transition::Skipped {
            status: JobStatus::Cancelled
        }
    );
    let job = get(&backend, id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result.is_none());
}

#[doc(hidden)]
pub async fn mark_job_complete_not_found(backend: impl Backend) {
    let result = backend.mark_job_complete(JobId::new(), Document::new()).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn mark_job_failed(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim_next(&backend).await.unwrap();

    let transition = backend
        .mark_job_failed(id, JobFailure::handler("smtp unavailable"))
        .await
        .unwrap();

    assert_eq!(transition, Transition::Applied);
    let job = get(&backend, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("smtp unavailable"));
    assert_eq!(job.error_kind, Some(FailureKind::Handler));
    assert!(job.completed_at.is_some());
    assert!(job.worker_id.is_none());
}

#[doc(hidden)]
pub async fn mark_job_failed_from_pending(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let transition = backend
        .mark_job_failed(id, JobFailure::no_handler(DEFAULT_JOB_TYPE))
        .await
        .unwrap();

    assert_eq!(transition, Transition::Applied);
    let job = get(&backend, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(FailureKind::NoHandler));
}

#[doc(hidden)]
pub async fn mark_job_failed_not_found(backend: impl Backend) {
    let result = backend
        .mark_job_failed(JobId::new(), JobFailure::handler("error"))
        .await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn mark_job_retryable(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim_next(&backend).await.unwrap();
    let next = Utc::now() + TimeDelta::minutes(5);

    let transition = backend.mark_job_retryable(id, next).await.unwrap();

    assert_eq!(transition, Transition::Applied);
    let job = get(&backend, id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);
    assert_close(job.scheduled_at, next);
    assert!(job.worker_id.is_none());
    assert!(job.locked_until.is_none());
    assert!(claim_next(&backend).await.is_none());
}

#[doc(hidden)]
pub async fn mark_job_retryable_exhausted(backend: impl Backend) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    claim_next(&backend).await.unwrap();
    let transition = backend.mark_job_retryable(id, Utc::now()).await.unwrap();
    assert_eq!(transition, Transition::Applied);
    claim_next(&backend).await.unwrap();

    let transition = backend.mark_job_retryable(id, Utc::now()).await.unwrap();

    assert_eq!(
        transition,
        Transition::Skipped {
            status: JobStatus::Processing
        }
    );
    assert_eq!(get(&backend, id).await.attempt_count, 1);
}

#[doc(hidden)]
pub async fn mark_job_retryable_not_found(backend: impl Backend) {
    let result = backend.mark_job_retryable(JobId::new(), Utc::now()).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn mark_job_cancelled(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let transition = backend.mark_job_cancelled(id).await.unwrap();

    assert_eq!(transition, Transition::Applied);
    assert_eq!(get(&backend, id).await.status, JobStatus::Cancelled);
    assert!(claim_next(&backend).await.is_none());
}

#[doc(hidden)]
pub async fn mark_job_cancelled_processing(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim_next(&backend).await.unwrap();

    let transition = backend.mark_job_cancelled(id).await.unwrap();

    assert_eq!(transition, Transition::Applied);
    let job = get(&backend, id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.worker_id.is_none());
}

#[doc(hidden)]
pub async fn mark_job_cancelled_completed(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim_next(&backend).await.unwrap();
    backend
        .mark_job_complete(id, Document::new())
        .await
        .unwrap();

    let transition = backend.mark_job_cancelled(id).await.unwrap();

    assert_eq!(
        transition,
        Transition::Skipped {
            status: JobStatus::Completed
        }
    );
    assert_eq!(get(&backend, id).await.status, JobStatus::Completed);
}

#[doc(hidden)]
pub async fn mark_job_cancelled_not_found(backend: impl Backend) {
    let result = backend.mark_job_cancelled(JobId::new()).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn queue_stats(backend: impl Backend) {
    let today = Utc::now().date_naive();
    let id1 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id3 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue("other"))
        .await
        .unwrap();

    for _ in 0..3 {
        claim_next(&backend).await.unwrap();
    }
    backend.mark_job_complete(id1, Document::new()).await.unwrap();
    backend.mark_job_complete(id2, Document::new()).await.unwrap();
    backend
        .mark_job_failed(id3, JobFailure::handler("error"))
        .await
        .unwrap();
    // Not counted twice.
    backend.mark_job_complete(id1, Document::new()).await.unwrap();

    let stats = backend.queue_stats(DEFAULT_QUEUE, today).await.unwrap();
    assert_eq!(stats.queue_name, DEFAULT_QUEUE);
    assert_eq!(stats.date, today);
    assert_eq!(stats.jobs_enqueued, 3);
    assert_eq!(stats.jobs_completed, 2);
    assert_eq!(stats.jobs_failed, 1);
    assert!(stats.total_processing_time_ms >= 0);
    assert!(stats.avg_processing_time_ms >= 0.0);

    let stats = backend.queue_stats("unused", today).await.unwrap();
    assert_eq!(stats, QueueStats::empty("unused", today));
}

#[doc(hidden)]
pub async fn query(backend: impl Backend) {
    let organization_id = Uuid::new_v4();
    let id1 = backend
        .enqueue(EnqueuableJob {
            organization_id: Some(organization_id),
            ..EnqueuableJob::mock_job()
        })
        .await
        .unwrap();
    let id2 = backend
        .enqueue(EnqueuableJob::mock_job().with_job_type("report.build"))
        .await
        .unwrap();
    let id3 = backend
        .enqueue(EnqueuableJob::mock_job().with_queue("low"))
        .await
        .unwrap();
    backend.mark_job_cancelled(id2).await.unwrap();

    let ids = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.id).collect::<HashSet<_>>();

    let jobs = backend.query(Where::all().into()).await.unwrap();
    assert_eq!(ids(jobs), HashSet::from([id1, id2, id3]));

    let jobs = backend
        .query(Where::queue_equals(DEFAULT_QUEUE).into())
        .await
        .unwrap();
    assert_eq!(ids(jobs), HashSet::from([id1, id2]));

    let jobs = backend
        .query(
            Where::status_equal(JobStatus::Pending)
                .and(!Where::queue_equals("low"))
                .into(),
        )
        .await
        .unwrap();
    assert_eq!(ids(jobs), HashSet::from([id1]));

    let jobs = backend
        .query(Where::organization_equals(organization_id).into())
        .await
        .unwrap();
    assert_eq!(ids(jobs), HashSet::from([id1]));

    let jobs = backend
        .query(
            Where::job_type_equals("report.build")
                .or(Where::id_equals(id3))
                .into(),
        )
        .await
        .unwrap();
    assert_eq!(ids(jobs), HashSet::from([id2, id3]));

    let jobs = backend
        .query(Where::scheduled_at_after(Utc::now() + TimeDelta::hours(1)).into())
        .await
        .unwrap();
    assert!(jobs.is_empty());
}
