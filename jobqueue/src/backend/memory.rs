//! Provides an in memory implementation of [`Backend`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and single process setups. Every operation takes a single lock over all jobs and statistics,
//! which makes claims trivially linearizable.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use super::{queryable::Queryable, Backend, BackendError, EnqueuableJob, Query, Transition};
use crate::{
    job::{Document, Job, JobFailure, JobId, JobStatus},
    stats::{QueueStats, StatsDelta},
};

/// An in memory implementation of [`Backend`].
///
/// Clones share the same underlying storage.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    jobs: Vec<Job>,
    stats: HashMap<(String, NaiveDate), QueueStats>,
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, BackendError> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(BackendError::JobNotFound(id))
    }

    fn record(&mut self, queue_name: &str, date: NaiveDate, delta: StatsDelta) {
        self.stats
            .entry((queue_name.to_owned(), date))
            .or_insert_with(|| QueueStats::empty(queue_name, date))
            .apply(delta);
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.state.read().map(|state| state.jobs.len()).ok();
        f.debug_struct("InMemoryBackend").field("jobs", &jobs).finish()
    }
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, BackendError> {
        self.state.read().map_err(|_| BackendError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, BackendError> {
        self.state.write().map_err(|_| BackendError::BadState)
    }
}

impl Job {
    fn release_lease(&mut self) {
        self.worker_id = None;
        self.locked_at = None;
        self.locked_until = None;
    }

    fn mark_job_processing(&mut self, worker_id: &str, lease: TimeDelta, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.worker_id = Some(worker_id.to_owned());
        self.locked_at = Some(now);
        self.locked_until = Some(
            now.checked_add_signed(lease)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        self.started_at = Some(now);
        self.updated_at = now;
    }

    fn mark_job_complete(&mut self, result: Document, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
        self.release_lease();
    }

    fn mark_job_failed(&mut self, failure: JobFailure, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(failure.message);
        self.error_kind = Some(failure.kind);
        self.completed_at = Some(now);
        self.updated_at = now;
        self.release_lease();
    }

    fn mark_job_retryable(&mut self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempt_count += 1;
        self.scheduled_at = scheduled_at;
        self.updated_at = now;
        self.release_lease();
    }

    fn mark_job_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.updated_at = now;
        self.release_lease();
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let now = Utc::now();
        let job = job.into_job(now)?;
        let id = job.id;

        let mut state = self.write()?;
        if state.jobs.iter().any(|existing| existing.id == id) {
            return Err(BackendError::DuplicateJob(id));
        }
        state.record(&job.queue_name, now.date_naive(), StatsDelta::enqueued());
        state.jobs.push(job);
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        queue_names: &[String],
        lease: TimeDelta,
    ) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let mut state = self.write()?;
        let job = state
            .jobs
            .iter_mut()
            .filter(|job| queue_names.contains(&job.queue_name) && job.is_claimable(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
            });

        Ok(job.map(|job| {
            job.mark_job_processing(worker_id, lease, now);
            job.clone()
        }))
    }

    async fn mark_job_complete(
        &self,
        id: JobId,
        result: Document,
    ) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Processing {
            return Ok(Transition::Skipped { status: job.status });
        }
        job.mark_job_complete(result, now);
        let queue_name = job.queue_name.clone();
        let delta = StatsDelta::completed(job.processing_time());
        state.record(&queue_name, now.date_naive(), delta);
        Ok(Transition::Applied)
    }

    async fn mark_job_failed(
        &self,
        id: JobId,
        failure: JobFailure,
    ) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.status.is_terminal() {
            return Ok(Transition::Skipped { status: job.status });
        }
        let was_processing = job.status == JobStatus::Processing;
        job.mark_job_failed(failure, now);
        let queue_name = job.queue_name.clone();
        let delta = StatsDelta::failed(job.processing_time().filter(|_| was_processing));
        state.record(&queue_name, now.date_naive(), delta);
        Ok(Transition::Applied)
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Processing || job.attempt_count >= job.max_attempts {
            return Ok(Transition::Skipped { status: job.status });
        }
        job.mark_job_retryable(next_scheduled_at, now);
        Ok(Transition::Applied)
    }

    async fn mark_job_cancelled(&self, id: JobId) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.status.is_terminal() {
            return Ok(Transition::Skipped { status: job.status });
        }
        job.mark_job_cancelled(now);
        Ok(Transition::Applied)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.read()?.jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn queue_stats(
        &self,
        queue_name: &str,
        date: NaiveDate,
    ) -> Result<QueueStats, BackendError> {
        Ok(self
            .read()?
            .stats
            .get(&(queue_name.to_owned(), date))
            .cloned()
            .unwrap_or_else(|| QueueStats::empty(queue_name, date)))
    }

    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError> {
        let mut jobs: Vec<Job> = self
            .read()?
            .jobs
            .iter()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}
