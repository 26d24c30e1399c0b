//! A durable, at-least-once job queue.
//!
//! Producers enqueue jobs into named queues; workers started by a [`Queue`] claim them one at a
//! time through an atomic, time-limited lease, dispatch them to registered handlers and record
//! the outcome. Failed jobs are retried with a configurable backoff until their attempts run
//! out. A worker that dies mid-job simply lets its lease expire, after which the job is claimed
//! again by another worker.
//!
//! # Example
//!
//! ```
//! # use jobqueue::prelude::*;
//! # use serde_json::json;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = Queue::new(InMemoryBackend::new());
//! queue
//!     .register_handler("email.send", |_ctx: HandlerContext, _payload: Vec<u8>| async {
//!         Ok::<_, HandlerError>(())
//!     })
//!     .unwrap();
//!
//! let id = queue
//!     .enqueue(EnqueuableJob::new("default", "email.send", json!({"to": "a@b.com"})))
//!     .await
//!     .unwrap();
//!
//! queue.start(CancellationToken::new(), 2).await.unwrap();
//! // ...
//! queue.stop().await.unwrap();
//! # let _ = id;
//! # });
//! ```
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use backend::{Backend, BackendError, EnqueuableJob, Transition};
use backoff::Strategy;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use config::QueueConfig;
use handler::{Executor, ExecutorHandler, Handler, HandlerRegistry};
use job::{query::Where, Job, JobFailure, JobId, ValidationError};
use stats::QueueStats;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use worker::{Worker, WorkerHandle};

pub mod backend;
pub mod backoff;
pub mod config;
pub mod handler;
pub mod job;
pub mod manager;
pub mod prelude;
pub mod stats;
pub mod testing;
mod worker;

/// A queue runtime: the handler registry, the configuration and the set of running workers,
/// all owned by this instance.
pub struct Queue<B: Backend + ?Sized> {
    backend: Arc<B>,
    config: QueueConfig,
    backoff: Arc<dyn Strategy>,
    registry: RwLock<HandlerRegistry>,
    running: AtomicBool,
    shutdown: RwLock<Option<CancellationToken>>,
    workers: Mutex<Option<Running>>,
}

struct Running {
    shutdown: CancellationToken,
    workers: Vec<WorkerHandle>,
}

impl<B: Backend + ?Sized> std::fmt::Debug for Queue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl<B: Backend + 'static> Queue<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }
}

impl<B> Queue<B>
where
    B: Backend + ?Sized + 'static,
{
    /// Creates a queue over a backend that is shared with other owners.
    pub fn from_arc(backend: Arc<B>) -> Self {
        let config = QueueConfig::default();
        Self {
            backend,
            backoff: Arc::new(config.backoff),
            config,
            registry: Default::default(),
            running: AtomicBool::new(false),
            shutdown: RwLock::new(None),
            workers: Mutex::new(None),
        }
    }

    /// Replaces the configuration, including the backoff policy.
    pub fn with_config(self, config: QueueConfig) -> Self {
        Self {
            backoff: Arc::new(config.backoff),
            config,
            ..self
        }
    }

    /// Uses a custom backoff strategy instead of the configured policy.
    pub fn with_backoff(self, backoff: impl Strategy + 'static) -> Self {
        Self {
            backoff: Arc::new(backoff),
            ..self
        }
    }

    /// Registers `E` as the handler for jobs of type [`Executor::NAME`].
    pub fn with_executor<E: Executor>(self) -> Result<Self, QueueError> {
        self.register_handler(E::NAME, ExecutorHandler::<E>::new())?;
        Ok(self)
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// False once the queue was stopped or the token passed to [`Queue::start`] was
    /// cancelled.
    pub fn is_running(&self) -> bool {
        let cancelled = self.shutdown.read().map_or(false, |shutdown| {
            shutdown.as_ref().is_some_and(CancellationToken::is_cancelled)
        });
        self.running.load(Ordering::SeqCst) && !cancelled
    }

    fn mark_running(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Registers `handler` for `job_type`, replacing any previous registration.
    ///
    /// Handlers must be registered before [`Queue::start`].
    pub fn register_handler(
        &self,
        job_type: impl Into<String>,
        handler: impl Handler,
    ) -> Result<(), QueueError> {
        if self.is_running() {
            return Err(QueueError::AlreadyRunning);
        }
        let job_type = job_type.into();
        let mut registry = self.registry.write().map_err(|_| QueueError::BadState)?;
        if registry.register(job_type.clone(), handler).is_some() {
            tracing::debug!(%job_type, "Replaced handler for {job_type}");
        }
        Ok(())
    }

    pub async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, QueueError> {
        let queue_name = job.queue_name.clone();
        let id = self
            .backend
            .enqueue(job)
            .await
            .map_err(QueueError::backend("enqueue job"))?;
        tracing::debug!(%id, %queue_name, "Enqueued job {id}");
        Ok(id)
    }

    pub async fn enqueue_at(
        &self,
        job: EnqueuableJob,
        scheduled_at: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        self.enqueue(EnqueuableJob {
            scheduled_at,
            ..job
        })
        .await
    }

    pub async fn enqueue_with_delay(
        &self,
        job: EnqueuableJob,
        delay: TimeDelta,
    ) -> Result<JobId, QueueError> {
        if delay < TimeDelta::zero() {
            return Err(ValidationError::NegativeDelay.into());
        }
        let scheduled_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.enqueue_at(job, scheduled_at).await
    }

    /// Claims the next eligible job from `queue_names` with the configured lease.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        queue_names: &[String],
    ) -> Result<Option<Job>, QueueError> {
        self.backend
            .claim(worker_id, queue_names, self.config.lease_duration())
            .await
            .map_err(QueueError::backend("claim job"))
    }

    pub async fn complete(
        &self,
        id: JobId,
        result: job::Document,
    ) -> Result<Transition, QueueError> {
        self.backend
            .mark_job_complete(id, result)
            .await
            .map_err(QueueError::backend("complete job"))
    }

    pub async fn fail(
        &self,
        id: JobId,
        error_message: impl Into<String>,
    ) -> Result<Transition, QueueError> {
        self.backend
            .mark_job_failed(id, JobFailure::handler(error_message))
            .await
            .map_err(QueueError::backend("fail job"))
    }

    /// Returns a processing job to `pending`, delayed by the backoff for its next attempt.
    pub async fn retry(&self, id: JobId) -> Result<Transition, QueueError> {
        let job = self.get_job(id).await?;
        let delay = self.backoff.backoff(job.attempt_count.saturating_add(1));
        let next_scheduled_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.backend
            .mark_job_retryable(id, next_scheduled_at)
            .await
            .map_err(QueueError::backend("retry job"))
    }

    /// Cancelling a job that already finished is not an error; it reports
    /// [`Transition::Skipped`].
    pub async fn cancel(&self, id: JobId) -> Result<Transition, QueueError> {
        self.backend
            .mark_job_cancelled(id)
            .await
            .map_err(QueueError::backend("cancel job"))
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, QueueError> {
        self.backend
            .get_job(id)
            .await
            .map_err(QueueError::backend("get job"))?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Today's counters for `queue_name`, in UTC.
    pub async fn get_stats(&self, queue_name: &str) -> Result<QueueStats, QueueError> {
        self.get_stats_on(queue_name, Utc::now().date_naive()).await
    }

    pub async fn get_stats_on(
        &self,
        queue_name: &str,
        date: NaiveDate,
    ) -> Result<QueueStats, QueueError> {
        self.backend
            .queue_stats(queue_name, date)
            .await
            .map_err(QueueError::backend("get queue stats"))
    }

    pub async fn query(&self, query: Where) -> Result<Vec<Job>, QueueError> {
        self.backend
            .query(query.into())
            .await
            .map_err(QueueError::backend("query jobs"))
    }

    /// Spawns `worker_count` workers polling the configured queues.
    ///
    /// Workers stop when [`Queue::stop`] is called or `token` is cancelled; handlers observe
    /// either through [`handler::HandlerContext::is_shutting_down`].
    pub async fn start(
        &self,
        token: CancellationToken,
        worker_count: usize,
    ) -> Result<(), QueueError> {
        if worker_count == 0 {
            return Err(ValidationError::NoWorkers.into());
        }
        if !self.mark_running() {
            if self.is_running() {
                return Err(QueueError::AlreadyRunning);
            }
            // The previous run was cancelled through its token; reap its workers first.
            self.stop().await?;
            if !self.mark_running() {
                return Err(QueueError::AlreadyRunning);
            }
        }

        let registry = match self.registry.read() {
            Ok(registry) => Arc::new(registry.clone()),
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(QueueError::BadState);
            }
        };
        let shutdown = token.child_token();
        match self.shutdown.write() {
            Ok(mut current) => *current = Some(shutdown.clone()),
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(QueueError::BadState);
            }
        }
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_id = &run_id[..8];

        let workers = (0..worker_count)
            .map(|i| {
                Worker {
                    id: format!("{}-{run_id}-{i}", self.config.worker_id_prefix),
                    backend: self.backend.clone(),
                    registry: registry.clone(),
                    queue_names: self.config.queues.clone(),
                    backoff: self.backoff.clone(),
                    poll_interval: self.config.poll_interval(),
                    lease: self.config.lease_duration(),
                    shutdown: shutdown.clone(),
                }
                .spawn()
            })
            .collect();

        tracing::info!(
            worker_count,
            queues = ?self.config.queues,
            job_types = ?registry,
            "Started {worker_count} workers"
        );
        *self.workers.lock().await = Some(Running { shutdown, workers });
        Ok(())
    }

    /// Signals every worker to exit after its current tick and waits for them.
    ///
    /// In-flight handlers are not interrupted. Stopping an idle queue does nothing.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let Some(mut running) = self.workers.lock().await.take() else {
            return Ok(());
        };
        tracing::debug!("Shutting down {} workers", running.workers.len());
        running.shutdown.cancel();
        let results = futures::future::join_all(
            running
                .workers
                .iter_mut()
                .map(WorkerHandle::graceful_shutdown),
        )
        .await;
        if let Ok(mut current) = self.shutdown.write() {
            *current = None;
        }
        self.running.store(false, Ordering::SeqCst);
        results.into_iter().collect()
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to {operation}: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("error encoding or decoding value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("the queue is already running")]
    AlreadyRunning,
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("system in bad state")]
    BadState,
}

impl QueueError {
    fn backend(operation: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| match source {
            BackendError::Validation(error) => Self::Validation(error),
            BackendError::JobNotFound(id) => Self::JobNotFound(id),
            source => Self::Backend { operation, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, MockBackend},
        handler::{HandlerContext, HandlerError},
        job::{Document, JobStatus},
    };
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use serde_json::json;

    fn ok_handler(
        _: HandlerContext,
        _: Vec<u8>,
    ) -> futures::future::Ready<Result<(), HandlerError>> {
        futures::future::ready(Ok(()))
    }

    fn fast_config() -> QueueConfig {
        QueueConfig::default().with_poll_interval(Duration::from_millis(5))
    }

    async fn wait_for_status<B: Backend + ?Sized + 'static>(
        queue: &Queue<B>,
        id: JobId,
        status: JobStatus,
    ) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = queue.get_job(id).await.unwrap();
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[derive(Deserialize)]
    struct Report {
        rows: u32,
    }

    struct BuildReport;

    #[async_trait::async_trait]
    impl Executor for BuildReport {
        type Data = Report;
        const NAME: &'static str = "report.build";

        async fn execute(_ctx: HandlerContext, data: Self::Data) -> Result<(), HandlerError> {
            match data.rows {
                0 => Err("empty report".into()),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn end_to_end() {
        let queue = Queue::new(InMemoryBackend::new()).with_config(fast_config());
        queue.register_handler("email.send", ok_handler).unwrap();
        let id = queue
            .enqueue(EnqueuableJob::new("default", "email.send", json!({"to": "a@b.com"})))
            .await
            .unwrap();
        assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Pending);

        queue.start(CancellationToken::new(), 2).await.unwrap();
        let job = wait_for_status(&queue, id, JobStatus::Completed).await;
        queue.stop().await.unwrap();

        assert!(job.result.is_some());
        assert!(job.worker_id.is_none());
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn executors_are_registered_by_name() {
        let queue = Queue::new(InMemoryBackend::new())
            .with_config(fast_config())
            .with_executor::<BuildReport>()
            .unwrap();
        let ok = queue
            .enqueue(EnqueuableJob::new("default", "report.build", json!({"rows": 3})))
            .await
            .unwrap();
        let failing = queue
            .enqueue(EnqueuableJob {
                max_attempts: 1,
                ..EnqueuableJob::new("default", "report.build", json!({"rows": 0}))
            })
            .await
            .unwrap();

        queue.start(CancellationToken::new(), 1).await.unwrap();
        wait_for_status(&queue, ok, JobStatus::Completed).await;
        let job = wait_for_status(&queue, failing, JobStatus::Failed).await;
        queue.stop().await.unwrap();

        assert_eq!(job.error_message.as_deref(), Some("empty report"));
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let queue = Queue::new(InMemoryBackend::new()).with_config(fast_config());

        assert_matches!(queue.stop().await, Ok(()));
        assert_matches!(
            queue.start(CancellationToken::new(), 0).await,
            Err(QueueError::Validation(ValidationError::NoWorkers))
        );

        queue.start(CancellationToken::new(), 1).await.unwrap();
        assert_matches!(
            queue.start(CancellationToken::new(), 1).await,
            Err(QueueError::AlreadyRunning)
        );
        assert_matches!(
            queue.register_handler("email.send", ok_handler),
            Err(QueueError::AlreadyRunning)
        );

        queue.stop().await.unwrap();
        assert_matches!(queue.register_handler("email.send", ok_handler), Ok(()));
        queue.start(CancellationToken::new(), 1).await.unwrap();
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn external_cancellation_stops_workers() {
        let queue = Queue::new(InMemoryBackend::new()).with_config(fast_config());
        let token = CancellationToken::new();
        queue.start(token.clone(), 3).await.unwrap();

        token.cancel();

        assert!(!queue.is_running());
        assert_matches!(queue.register_handler("email.send", ok_handler), Ok(()));
        queue.start(CancellationToken::new(), 1).await.unwrap();
        assert!(queue.is_running());
        assert_matches!(queue.stop().await, Ok(()));
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn delayed_jobs_wait() {
        let queue = Queue::new(InMemoryBackend::new());
        let queues = vec!["default".to_owned()];
        let id = queue
            .enqueue_with_delay(
                EnqueuableJob::new("default", "email.send", json!({})),
                TimeDelta::milliseconds(200),
            )
            .await
            .unwrap();

        assert!(queue.dequeue("worker-1", &queues).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(250)).await;

        let job = queue.dequeue("worker-1", &queues).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn sub_second_lease_is_exclusive_until_expiry() {
        let queue = Queue::new(InMemoryBackend::new())
            .with_config(QueueConfig::default().with_lease_duration(Duration::from_millis(800)));
        let queues = vec!["default".to_owned()];
        let id = queue
            .enqueue(EnqueuableJob::new("default", "email.send", json!({})))
            .await
            .unwrap();

        let job = queue.dequeue("worker-1", &queues).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.dequeue("worker-2", &queues).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(900)).await;
        let job = queue.dequeue("worker-2", &queues).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.worker_id.as_deref(), Some("worker-2"));
    }

    #[tokio::test]
    async fn negative_delay_rejected() {
        let queue = Queue::new(InMemoryBackend::new());

        assert_matches!(
            queue
                .enqueue_with_delay(
                    EnqueuableJob::new("default", "email.send", json!({})),
                    TimeDelta::seconds(-1),
                )
                .await,
            Err(QueueError::Validation(ValidationError::NegativeDelay))
        );
    }

    #[tokio::test]
    async fn manual_contract() {
        let queue = Queue::new(InMemoryBackend::new());
        let queues = vec!["default".to_owned()];
        let id = queue
            .enqueue(EnqueuableJob::new("default", "email.send", json!({})))
            .await
            .unwrap();

        queue.dequeue("worker-1", &queues).await.unwrap().unwrap();
        let before = Utc::now();
        assert_eq!(queue.retry(id).await.unwrap(), Transition::Applied);
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 1);
        assert!(job.scheduled_at >= before + TimeDelta::minutes(5));

        assert_eq!(queue.fail(id, "gave up").await.unwrap(), Transition::Applied);
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("gave up"));

        assert_eq!(
            queue.cancel(id).await.unwrap(),
            Transition::Skipped {
                status: JobStatus::Failed
            }
        );
        assert_eq!(queue.get_stats("default").await.unwrap().jobs_failed, 1);
    }

    #[tokio::test]
    async fn unknown_jobs() {
        let queue = Queue::new(InMemoryBackend::new());
        let id = JobId::new();

        assert_matches!(
            queue.get_job(id).await,
            Err(QueueError::JobNotFound(missing)) if missing == id
        );
        assert_matches!(
            queue.complete(id, Document::new()).await,
            Err(QueueError::JobNotFound(_))
        );
        assert_matches!(queue.retry(id).await, Err(QueueError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn backend_errors_carry_operation() {
        let mut backend = MockBackend::new();
        backend
            .expect_enqueue()
            .returning(|_| Err(BackendError::Database("connection refused".to_owned())));
        let queue = Queue::new(backend);

        let error = queue
            .enqueue(EnqueuableJob::new("default", "email.send", json!({})))
            .await
            .unwrap_err();

        assert_matches!(
            error,
            QueueError::Backend {
                operation: "enqueue job",
                ..
            }
        );
        assert_eq!(
            error.to_string(),
            "failed to enqueue job: error communicating with the database: connection refused"
        );
    }

    #[tokio::test]
    async fn queues_do_not_share_handlers() {
        let backend = Arc::new(InMemoryBackend::new());
        let first = Queue::from_arc(backend.clone()).with_config(fast_config());
        let second = Queue::from_arc(backend);
        first.register_handler("email.send", ok_handler).unwrap();

        assert!(first.registry.read().unwrap().contains("email.send"));
        assert!(!second.registry.read().unwrap().contains("email.send"));
    }
}
