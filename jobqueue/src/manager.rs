//! Producer-facing façade over a [`Queue`].
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    backend::{Backend, Transition},
    job::{
        options::JobOptions, query::Where, Document, FailureKind, Job, JobId, JobStatus,
    },
    stats::QueueStats,
    Queue, QueueError,
};

/// A read-only projection of a [`Job`] for callers outside the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub status: JobStatus,
    pub payload: Document,
    pub result: Option<Document>,
    pub error_message: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub organization_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            queue_name: job.queue_name,
            job_type: job.job_type,
            status: job.status,
            payload: job.payload,
            result: job.result,
            error_message: job.error_message,
            error_kind: job.error_kind,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            priority: job.priority,
            organization_id: job.organization_id,
            user_id: job.user_id,
            scheduled_at: job.scheduled_at,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
        }
    }
}

/// Translates producer requests into jobs and exposes status and administration operations.
///
/// # Example
///
/// ```
/// # use jobqueue::prelude::*;
/// # use serde_json::json;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let manager = QueueManager::new(Queue::new(InMemoryBackend::new()));
///
/// let id = manager
///     .enqueue_job(
///         "default",
///         "email.send",
///         json!({"to": "a@b.com"}),
///         JobOptions::default().with_priority(5),
///     )
///     .await
///     .unwrap();
///
/// assert_eq!(manager.get_job_status(id).await.unwrap().status, JobStatus::Pending);
/// # });
/// ```
pub struct QueueManager<B: Backend + ?Sized> {
    queue: Arc<Queue<B>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl<B: Backend + ?Sized> std::fmt::Debug for QueueManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<B> QueueManager<B>
where
    B: Backend + ?Sized + 'static,
{
    pub fn new(queue: Queue<B>) -> Self {
        Self::from_arc(Arc::new(queue))
    }

    pub fn from_arc(queue: Arc<Queue<B>>) -> Self {
        Self {
            queue,
            shutdown: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<Queue<B>> {
        &self.queue
    }

    /// Enqueues a job built from `options`.
    ///
    /// `payload` must serialize to a JSON object.
    pub async fn enqueue_job(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: impl Serialize,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let job = options.into_enqueuable(
            queue_name,
            job_type,
            payload,
            self.queue.config().default_max_attempts,
        )?;
        self.queue.enqueue(job).await
    }

    /// Enqueues a job that becomes eligible at `scheduled_at`.
    pub async fn schedule_job(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: impl Serialize,
        scheduled_at: DateTime<Utc>,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.enqueue_job(
            queue_name,
            job_type,
            payload,
            options.schedule_at(scheduled_at),
        )
        .await
    }

    /// Cancelling a finished job leaves it unchanged and is not an error.
    pub async fn cancel_job(&self, id: JobId) -> Result<Transition, QueueError> {
        let transition = self.queue.cancel(id).await?;
        if let Transition::Skipped { status } = transition {
            tracing::debug!(%id, %status, "Job {id} is already {status}, not cancelled");
        }
        Ok(transition)
    }

    pub async fn get_job_status(&self, id: JobId) -> Result<JobStatusView, QueueError> {
        self.queue.get_job(id).await.map(Into::into)
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats, QueueError> {
        self.queue.get_stats(queue_name).await
    }

    pub async fn get_queue_stats_on(
        &self,
        queue_name: &str,
        date: NaiveDate,
    ) -> Result<QueueStats, QueueError> {
        self.queue.get_stats_on(queue_name, date).await
    }

    /// Jobs matching `query`, most recently created first.
    pub async fn list_jobs(&self, query: Where) -> Result<Vec<JobStatusView>, QueueError> {
        Ok(self
            .queue
            .query(query)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    pub async fn start_worker(&self, worker_count: usize) -> Result<(), QueueError> {
        let token = CancellationToken::new();
        self.queue.start(token.clone(), worker_count).await?;
        *self.shutdown.lock().await = Some(token);
        Ok(())
    }

    pub async fn stop_worker(&self) -> Result<(), QueueError> {
        if let Some(token) = self.shutdown.lock().await.take() {
            token.cancel();
        }
        self.queue.stop().await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        config::QueueConfig,
        handler::{HandlerContext, HandlerError},
        job::ValidationError,
    };
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde_json::json;

    fn manager() -> QueueManager<InMemoryBackend> {
        let queue = Queue::new(InMemoryBackend::new()).with_config(
            QueueConfig::default()
                .with_queues(["default", "critical"])
                .with_poll_interval(Duration::from_millis(5)),
        );
        QueueManager::new(queue)
    }

    #[derive(Serialize)]
    struct Email<'a> {
        to: &'a str,
    }

    #[tokio::test]
    async fn end_to_end() {
        let manager = manager();
        manager
            .queue()
            .register_handler("email.send", |_: HandlerContext, payload: Vec<u8>| async move {
                let payload: serde_json::Value = serde_json::from_slice(&payload)?;
                assert_eq!(payload, json!({"to": "a@b.com"}));
                Ok::<_, HandlerError>(())
            })
            .unwrap();

        let id = manager
            .enqueue_job(
                "default",
                "email.send",
                Email { to: "a@b.com" },
                JobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            manager.get_job_status(id).await.unwrap().status,
            JobStatus::Pending
        );

        manager.start_worker(1).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = manager.get_job_status(id).await.unwrap();
                if status.status == JobStatus::Completed {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        manager.stop_worker().await.unwrap();

        assert!(status.result.is_some());
        assert!(status.completed_at.is_some());
        let stats = manager.get_queue_stats("default").await.unwrap();
        assert_eq!(stats.jobs_enqueued, 1);
        assert_eq!(stats.jobs_completed, 1);
    }

    #[tokio::test]
    async fn options_are_applied() {
        let manager = manager();
        let organization_id = Uuid::new_v4();

        let id = manager
            .enqueue_job(
                "critical",
                "contacts.import",
                json!({"file": "contacts.csv"}),
                JobOptions::default()
                    .with_priority(10)
                    .with_delay(TimeDelta::minutes(1))
                    .with_max_retries(6)
                    .with_organization_id(organization_id)
                    .add_metadata("source", "upload"),
            )
            .await
            .unwrap();

        let status = manager.get_job_status(id).await.unwrap();
        assert_eq!(status.queue_name, "critical");
        assert_eq!(status.priority, 10);
        assert_eq!(status.max_attempts, 6);
        assert_eq!(status.organization_id, Some(organization_id));
        assert!(status.scheduled_at > Utc::now());
        let job = manager.queue().get_job(id).await.unwrap();
        assert_eq!(job.metadata["source"], "upload");
    }

    #[tokio::test]
    async fn default_max_retries_from_config() {
        let manager = manager();

        let id = manager
            .enqueue_job("default", "email.send", json!({}), JobOptions::default())
            .await
            .unwrap();

        assert_eq!(manager.get_job_status(id).await.unwrap().max_attempts, 3);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let manager = manager();

        assert_matches!(
            manager
                .enqueue_job("default", "email.send", vec![1, 2], JobOptions::default())
                .await,
            Err(QueueError::Validation(ValidationError::MalformedPayload("an array")))
        );
        assert_matches!(
            manager
                .enqueue_job("", "email.send", json!({}), JobOptions::default())
                .await,
            Err(QueueError::Validation(ValidationError::MissingQueueName))
        );
        assert_matches!(
            manager
                .schedule_job(
                    "default",
                    "email.send",
                    json!({}),
                    Utc::now(),
                    JobOptions::default().with_delay(TimeDelta::seconds(5)),
                )
                .await,
            Err(QueueError::Validation(ValidationError::ConflictingSchedule))
        );
        assert!(manager.list_jobs(Where::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_job_is_partial() {
        let manager = manager();
        let queues = vec!["default".to_owned()];
        let finished = manager
            .enqueue_job("default", "email.send", json!({}), JobOptions::default())
            .await
            .unwrap();
        let scheduled = manager
            .schedule_job(
                "default",
                "email.send",
                json!({}),
                Utc::now() + TimeDelta::hours(1),
                JobOptions::default(),
            )
            .await
            .unwrap();
        let claimed = manager
            .queue()
            .dequeue("worker-1", &queues)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, finished);
        manager
            .queue()
            .complete(finished, Document::new())
            .await
            .unwrap();

        assert_eq!(
            manager.cancel_job(finished).await.unwrap(),
            Transition::Skipped {
                status: JobStatus::Completed
            }
        );
        assert_eq!(manager.cancel_job(scheduled).await.unwrap(), Transition::Applied);
        assert_eq!(
            manager.get_job_status(scheduled).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert_matches!(
            manager.cancel_job(JobId::new()).await,
            Err(QueueError::JobNotFound(_))
        );
    }

    #[tokio::test]
    async fn list_jobs_filters() {
        let manager = manager();
        let first = manager
            .enqueue_job("default", "email.send", json!({}), JobOptions::default())
            .await
            .unwrap();
        manager
            .enqueue_job("critical", "email.send", json!({}), JobOptions::default())
            .await
            .unwrap();

        let jobs = manager
            .list_jobs(Where::queue_equals("default"))
            .await
            .unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, first);
    }

    #[tokio::test]
    async fn stats_for_past_days_are_empty() {
        let manager = manager();
        manager
            .enqueue_job("default", "email.send", json!({}), JobOptions::default())
            .await
            .unwrap();
        let yesterday = Utc::now().date_naive() - TimeDelta::days(1);

        let stats = manager
            .get_queue_stats_on("default", yesterday)
            .await
            .unwrap();

        assert_eq!(stats, QueueStats::empty("default", yesterday));
    }
}
