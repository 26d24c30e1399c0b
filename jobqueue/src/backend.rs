//! The storage contract for jobs.
//!
//! A [`Backend`] is the single writer of job status and lease fields. Its two critical
//! operations are [`Backend::enqueue`] and [`Backend::claim`]; the latter must select and lease
//! a job atomically so that concurrent callers never receive the same job.
//!
//! All terminal transitions are partial: calling one from a state it is not valid from leaves
//! the job unchanged and reports [`Transition::Skipped`] rather than an error.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    job::{json_kind, Document, Job, JobFailure, JobId, JobStatus, ValidationError},
    stats::QueueStats,
};

pub mod memory;
pub(crate) mod queryable;
#[doc(hidden)]
pub mod testing;

/// Storage for jobs and their statistics.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Validates and stores a new `pending` job, counting it in today's statistics.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;

    /// Atomically leases the next eligible job from any of `queue_names`.
    ///
    /// A job is eligible when it is due and either `pending` or `processing` with an expired
    /// lease. Eligible jobs are ordered by `priority desc, scheduled_at asc`. Returns `None`
    /// when nothing is eligible.
    async fn claim(
        &self,
        worker_id: &str,
        queue_names: &[String],
        lease: TimeDelta,
    ) -> Result<Option<Job>, BackendError>;

    /// `processing -> completed`.
    async fn mark_job_complete(
        &self,
        id: JobId,
        result: Document,
    ) -> Result<Transition, BackendError>;

    /// `pending | processing -> failed`.
    async fn mark_job_failed(
        &self,
        id: JobId,
        failure: JobFailure,
    ) -> Result<Transition, BackendError>;

    /// `processing -> pending`, consuming an attempt and releasing the lease.
    ///
    /// Skipped once `attempt_count` has reached `max_attempts`.
    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<Transition, BackendError>;

    /// `pending | processing -> cancelled`.
    async fn mark_job_cancelled(&self, id: JobId) -> Result<Transition, BackendError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    /// Counters for `queue_name` on `date`, zeroed if nothing was recorded.
    async fn queue_stats(
        &self,
        queue_name: &str,
        date: NaiveDate,
    ) -> Result<QueueStats, BackendError>;

    /// Jobs matching `query`, most recently created first.
    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError>;
}

/// Outcome of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The job was in `status`, from which the transition is not valid. Nothing changed.
    Skipped { status: JobStatus },
}

impl Transition {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A job as submitted by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    /// Assigned on enqueue when absent.
    pub id: Option<JobId>,
    pub queue_name: String,
    pub job_type: String,
    /// Must be a JSON object.
    pub payload: Value,
    /// Must be a JSON object or null.
    pub metadata: Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub organization_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub timeout_seconds: Option<u32>,
}

impl EnqueuableJob {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(queue_name: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            metadata: Value::Null,
            priority: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            scheduled_at: Utc::now(),
            organization_id: None,
            user_id: None,
            timeout_seconds: None,
        }
    }

    pub fn with_queue(self, queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..self
        }
    }

    pub fn with_job_type(self, job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..self
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn with_id(self, id: JobId) -> Self {
        Self {
            id: Some(id),
            ..self
        }
    }

    pub fn with_metadata(self, metadata: Value) -> Self {
        Self { metadata, ..self }
    }

    pub fn with_organization_id(self, organization_id: Uuid) -> Self {
        Self {
            organization_id: Some(organization_id),
            ..self
        }
    }

    pub fn with_user_id(self, user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue_name.trim().is_empty() {
            return Err(ValidationError::MissingQueueName);
        }
        if self.job_type.trim().is_empty() {
            return Err(ValidationError::MissingJobType);
        }
        if !self.payload.is_object() {
            return Err(ValidationError::MalformedPayload(json_kind(&self.payload)));
        }
        if !(self.metadata.is_object() || self.metadata.is_null()) {
            return Err(ValidationError::MalformedMetadata(json_kind(&self.metadata)));
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidMaxAttempts);
        }
        Ok(())
    }

    /// Validates the job and builds the `pending` record to store.
    pub fn into_job(self, now: DateTime<Utc>) -> Result<Job, ValidationError> {
        self.validate()?;
        let payload = match self.payload {
            Value::Object(payload) => payload,
            other => return Err(ValidationError::MalformedPayload(json_kind(&other))),
        };
        let metadata = match self.metadata {
            Value::Object(metadata) => metadata,
            _ => Document::new(),
        };
        Ok(Job {
            id: self.id.unwrap_or_default(),
            queue_name: self.queue_name,
            job_type: self.job_type,
            payload,
            result: None,
            error_message: None,
            error_kind: None,
            priority: self.priority,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            worker_id: None,
            locked_at: None,
            locked_until: None,
            scheduled_at: self.scheduled_at,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            organization_id: self.organization_id,
            user_id: self.user_id,
            timeout_seconds: self.timeout_seconds,
            metadata,
        })
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),
    #[error("error encoding or decoding job data: {0}")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("error communicating with the database: {0}")]
    Database(String),
    #[error("system in bad state")]
    BadState,
}

/// Filter over stored jobs. Usually built with [`crate::job::query::Where`].
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Not(Box<Query>),
    /// Matches everything when empty.
    And(Vec<Query>),
    /// Matches nothing when empty.
    Or(Vec<Query>),
    IdEquals(JobId),
    QueueEqual(String),
    JobTypeEqual(String),
    StatusEqual(JobStatus),
    PayloadEquals(Value),
    OrganizationEqual(Uuid),
    ScheduledAtBefore(DateTime<Utc>),
    ScheduledAtAfter(DateTime<Utc>),
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn validate_requires_queue_and_type() {
        assert_matches!(
            EnqueuableJob::new(" ", "email.send", json!({})).validate(),
            Err(ValidationError::MissingQueueName)
        );
        assert_matches!(
            EnqueuableJob::new("default", "", json!({})).validate(),
            Err(ValidationError::MissingJobType)
        );
    }

    #[test]
    fn validate_requires_object_payload() {
        assert_matches!(
            EnqueuableJob::new("default", "email.send", json!(["a"])).validate(),
            Err(ValidationError::MalformedPayload("an array"))
        );
        assert_matches!(
            EnqueuableJob::new("default", "email.send", Value::Null).validate(),
            Err(ValidationError::MalformedPayload("null"))
        );
    }

    #[test]
    fn validate_max_attempts() {
        let job = EnqueuableJob {
            max_attempts: 0,
            ..EnqueuableJob::new("default", "email.send", json!({}))
        };
        assert_matches!(job.validate(), Err(ValidationError::InvalidMaxAttempts));
    }

    #[test]
    fn into_job_is_pending() {
        let now = Utc::now();
        let job = EnqueuableJob::new("default", "email.send", json!({"to": "a@b.com"}))
            .into_job(now)
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.created_at, now);
        assert!(job.worker_id.is_none());
        assert!(job.locked_until.is_none());
        assert!(job.metadata.is_empty());
        assert_eq!(Value::Object(job.payload), json!({"to": "a@b.com"}));
    }

    #[test]
    fn into_job_keeps_given_id() {
        let id = JobId::new();
        let job = EnqueuableJob {
            id: Some(id),
            ..EnqueuableJob::new("default", "email.send", json!({}))
        };

        assert_eq!(job.into_job(Utc::now()).unwrap().id, id);
    }
}
