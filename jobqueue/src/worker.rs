//! The polling loop that claims and runs jobs.
//!
//! Each worker processes one job per tick. Parallelism comes from running several workers
//! against the same backend; the backend's atomic claim is the only coordination between them.
//!
//! A handler that outlives its lease can have its job reclaimed by another worker while it is
//! still running. Leases are not renewed; such overruns are logged.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError, Transition},
    backoff::Strategy,
    handler::{HandlerContext, HandlerRegistry},
    job::{Document, Job, JobFailure, JobId},
    QueueError,
};

pub(crate) struct Worker<B: Backend + ?Sized> {
    pub(crate) id: String,
    pub(crate) backend: Arc<B>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) queue_names: Vec<String>,
    pub(crate) backoff: Arc<dyn Strategy>,
    pub(crate) poll_interval: Duration,
    pub(crate) lease: TimeDelta,
    pub(crate) shutdown: CancellationToken,
}

enum Message {
    Terminate,
}

#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id: String,
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stops the loop after any in-flight job has been reported.
    pub(crate) async fn graceful_shutdown(&mut self) -> Result<(), QueueError> {
        // The loop may already have exited through its cancellation token.
        let _ = self.sender.send(Message::Terminate);
        if let Some(handle) = self.handle.take() {
            handle.await.map_err(|error| {
                tracing::error!(
                    ?error,
                    worker_id = %self.id,
                    "Worker {} did not shut down cleanly",
                    self.id
                );
                QueueError::GracefulShutdownFailed
            })?;
        }
        Ok(())
    }
}

impl<B> Worker<B>
where
    B: Backend + ?Sized + 'static,
{
    pub(crate) fn spawn(self) -> WorkerHandle {
        let (sender, mut rx) = mpsc::unbounded_channel();
        let id = self.id.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                worker_id = %self.id,
                queues = ?self.queue_names,
                "Worker {} started",
                self.id
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    },
                    _ = rx.recv() => break,
                    _ = self.shutdown.cancelled() => break,
                }
            }
            tracing::info!(worker_id = %self.id, "Worker {} stopped", self.id);
        });

        WorkerHandle {
            id,
            sender,
            handle: Some(handle),
        }
    }

    /// Claims and runs at most one job, returning its id.
    ///
    /// Backend errors are logged and swallowed so the loop keeps polling.
    pub(crate) async fn tick(&self) -> Option<JobId> {
        let job = match self
            .backend
            .claim(&self.id, &self.queue_names, self.lease)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(error) => {
                tracing::error!(?error, worker_id = %self.id, "Failed to claim job: {error}");
                return None;
            }
        };
        let job_id = job.id;
        self.execute_job(job).await;
        Some(job_id)
    }

    #[instrument(
        skip(self, job),
        fields(
            worker_id = %self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt_count
        )
    )]
    async fn execute_job(&self, job: Job) {
        let job_id = job.id;
        let Some(handler) = self.registry.get(&job.job_type) else {
            let failure = JobFailure::no_handler(&job.job_type);
            tracing::error!(%job_id, "Job {job_id} cannot run: {failure}");
            self.handle_job_failed(job_id, failure).await;
            return;
        };
        let payload = match job.payload_bytes() {
            Ok(payload) => payload,
            Err(error) => {
                let failure =
                    JobFailure::infrastructure(format!("failed to encode payload: {error}"));
                self.handle_job_failed(job_id, failure).await;
                return;
            }
        };

        let ctx = HandlerContext::new(&job, &self.id, self.shutdown.clone());
        tracing::debug!(%job_id, "Executing job {job_id}");
        let started = Instant::now();
        let result =
            tokio::spawn(async move { handler.handle(ctx, payload).await }.in_current_span()).await;
        let elapsed = started.elapsed();

        if TimeDelta::from_std(elapsed).is_ok_and(|elapsed| elapsed > self.lease) {
            tracing::warn!(
                %job_id,
                ?elapsed,
                "Job {job_id} ran longer than its lease and may have been claimed by another worker"
            );
        }

        match result {
            Ok(Ok(())) => self.handle_job_complete(job_id, elapsed).await,
            Ok(Err(error)) => {
                self.handle_job_error(&job, JobFailure::handler(error.to_string()))
                    .await
            }
            Err(error) => self.handle_job_error(&job, JobFailure::from(error)).await,
        }
    }

    async fn handle_job_complete(&self, job_id: JobId, elapsed: Duration) {
        let mut result = Document::new();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        result.insert("duration_ms".to_owned(), duration_ms.into());
        result.insert("completed_at".to_owned(), Utc::now().to_rfc3339().into());

        tracing::debug!(%job_id, duration_ms, "Job {job_id} complete");
        let outcome = self.backend.mark_job_complete(job_id, result).await;
        log_outcome(job_id, "complete", outcome);
    }

    async fn handle_job_error(&self, job: &Job, failure: JobFailure) {
        let job_id = job.id;
        if !failure.is_retryable() || job.is_final_attempt() {
            tracing::error!(
                %job_id,
                kind = %failure.kind,
                "Job {job_id} failed and will not be retried: {failure}",
            );
            self.handle_job_failed(job_id, failure).await;
            return;
        }

        let delay = self.backoff.backoff(job.attempt_count + 1);
        let next_scheduled_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        tracing::warn!(
            %job_id,
            kind = %failure.kind,
            "Job {job_id} failed and will be retried in {delay}: {failure}",
        );
        let outcome = self
            .backend
            .mark_job_retryable(job_id, next_scheduled_at)
            .await;
        log_outcome(job_id, "retryable", outcome);
    }

    async fn handle_job_failed(&self, job_id: JobId, failure: JobFailure) {
        let outcome = self.backend.mark_job_failed(job_id, failure).await;
        log_outcome(job_id, "failed", outcome);
    }
}

fn log_outcome(job_id: JobId, state: &str, outcome: Result<Transition, BackendError>) {
    match outcome {
        Ok(Transition::Applied) => {}
        Ok(Transition::Skipped { status }) => tracing::info!(
            %job_id,
            %status,
            "Job {job_id} was {status} before it could be marked as {state}",
        ),
        Err(err) => tracing::error!(
            ?err,
            %job_id,
            "Failed to mark job {job_id} as {state}, error: {err:?}",
        ),
    }
}
