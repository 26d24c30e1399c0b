//! Helpers for testing producers.

/// Asserts which jobs have been enqueued into a backend.
///
/// Constraints may be combined freely; without a count the assertion expects at least one
/// matching job.
///
/// # Example
///
/// ```
/// # use jobqueue::prelude::*;
/// # use jobqueue::testing::assert_enqueued;
/// # use chrono::{TimeDelta, Utc};
/// # use serde_json::json;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let backend = InMemoryBackend::new();
/// let scheduled_at = Utc::now() + TimeDelta::minutes(5);
///
/// backend
///     .enqueue(
///         EnqueuableJob::new("default", "email.send", json!({"to": "a@b.com"}))
///             .with_scheduled_at(scheduled_at),
///     )
///     .await
///     .unwrap();
///
/// assert_enqueued!(
///     to: backend,
///     with_payload: json!({"to": "a@b.com"}),
///     of_type: "email.send"
/// );
///
/// assert_enqueued!(
///     1 job,
///     to: backend,
///     in_queue: "default",
///     scheduled_after: Utc::now(),
///     with_status: JobStatus::Pending,
/// );
///
/// assert_enqueued!(0 jobs, to: backend, in_queue: "critical");
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $backend:expr, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal 1, $backend; $($tail)*)
    };
    ($n:literal jobs, to: $backend:expr, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal $n, $backend; $($tail)*)
    };
    (to: $backend:expr, $($tail:tt)*) => {{
        use $crate::backend::{Backend, Query};
        let mut queries = Vec::new();
        $crate::assert_enqueued!(@query queries; $($tail)*);
        let jobs = $backend.query(Query::And(queries)).await.unwrap();
        let all_jobs = $backend.query(Query::And(vec![])).await.unwrap();
        assert!(
            !jobs.is_empty(),
            "No jobs enqueued matching {}\n\nAll enqueued jobs:\n{all_jobs:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal, $backend:expr; $($tail:tt)*) => {{
        use $crate::backend::{Backend, Query};
        let mut queries = Vec::new();
        $crate::assert_enqueued!(@query queries; $($tail)*);
        let jobs = $backend.query(Query::And(queries)).await.unwrap();
        let all_jobs = $backend.query(Query::And(vec![])).await.unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs enqueued matching {},\n\n\
            Expected {} jobs, found {}:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All enqueued jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query $vec:ident;) => {};
    (@query $vec:ident; with_payload: $payload:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::PayloadEquals(serde_json::to_value($payload).unwrap()));
        $($crate::assert_enqueued!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; in_queue: $queue:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::QueueEqual(($queue).into()));
        $($crate::assert_enqueued!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; of_type: $job_type:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::JobTypeEqual(($job_type).into()));
        $($crate::assert_enqueued!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::StatusEqual($status));
        $($crate::assert_enqueued!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; scheduled_after: $scheduled_after:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::ScheduledAtAfter($scheduled_after));
        $($crate::assert_enqueued!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; scheduled_before: $scheduled_before:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::ScheduledAtBefore($scheduled_before));
        $($crate::assert_enqueued!(@query $vec; $($tail)*);)?
    };
}

pub use assert_enqueued;
