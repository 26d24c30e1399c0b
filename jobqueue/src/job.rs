//! The persisted unit of work and its lifecycle.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinError;
use uuid::Uuid;

pub mod options;
pub mod query;

/// An ordered key/value document, used for payloads, results and metadata.
pub type Document = Map<String, Value>;

/// Globally unique identifier of a job.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
///
/// `pending -> processing -> {completed | failed | pending (retry)}` and
/// `pending | processing -> cancelled`. The terminal states are never left.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored string does not name a known variant.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseError {
                kind: "job status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Classification of why a job did not complete.
///
/// The free text lives in [`Job::error_message`]; the kind lets callers branch without
/// matching on message contents.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job was malformed.
    Validation,
    /// No handler is registered for the job type. Never retried.
    NoHandler,
    /// The handler returned an error.
    Handler,
    /// The handler panicked.
    Panic,
    /// The queue itself failed while processing the job.
    Infrastructure,
}

impl FailureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NoHandler => "no_handler",
            Self::Handler => "handler",
            Self::Panic => "panic",
            Self::Infrastructure => "infrastructure",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "no_handler" => Ok(Self::NoHandler),
            "handler" => Ok(Self::Handler),
            "panic" => Ok(Self::Panic),
            "infrastructure" => Ok(Self::Infrastructure),
            other => Err(ParseError {
                kind: "failure kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// A classified failure, formatted into the stored error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn no_handler(job_type: &str) -> Self {
        Self::new(
            FailureKind::NoHandler,
            format!("no handler registered for job type: {job_type}"),
        )
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Handler, message)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Infrastructure, message)
    }

    /// Whether retrying could possibly change the outcome.
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Handler | FailureKind::Panic)
    }
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<JoinError> for JobFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        if !value.is_panic() {
            return Self::infrastructure(msg);
        }
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(FailureKind::Panic, message)
    }
}

/// Reasons a job is rejected before it is ever stored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("queue name is required")]
    MissingQueueName,
    #[error("job type is required")]
    MissingJobType,
    #[error("payload must be a JSON object, got {0}")]
    MalformedPayload(&'static str),
    #[error("metadata must be a JSON object, got {0}")]
    MalformedMetadata(&'static str),
    #[error("max attempts must be at least 1")]
    InvalidMaxAttempts,
    #[error("delay and scheduled_at are mutually exclusive")]
    ConflictingSchedule,
    #[error("delay must not be negative")]
    NegativeDelay,
    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Article and name of a JSON value's kind, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A job as stored by a [`crate::backend::Backend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Document,
    pub result: Option<Document>,
    pub error_message: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub priority: i32,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub organization_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// Recorded for callers; the queue does not enforce it.
    pub timeout_seconds: Option<u32>,
    pub metadata: Document,
}

impl Job {
    /// True when a failure of the current attempt should not be retried.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt_count.saturating_add(1) >= self.max_attempts
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.locked_until.is_some_and(|locked_until| locked_until < now)
    }

    /// Whether a claim made at `now` may pick this job.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && (self.status == JobStatus::Pending || self.lease_expired(now))
    }

    /// Time between the last claim and the terminal transition.
    pub fn processing_time(&self) -> Option<TimeDelta> {
        Some(self.completed_at? - self.started_at?)
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn status_wire_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                Value::String(status.to_string())
            );
        }
        assert_matches!("running".parse::<JobStatus>(), Err(ParseError { .. }));
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn no_handler_failure_message() {
        let failure = JobFailure::no_handler("email.send");
        assert_eq!(failure.kind, FailureKind::NoHandler);
        assert_eq!(
            failure.to_string(),
            "no handler registered for job type: email.send"
        );
        assert!(!failure.is_retryable());
        assert_eq!("no_handler".parse::<FailureKind>(), Ok(FailureKind::NoHandler));
    }

    #[test]
    fn final_attempt() {
        let mut job = Job::raw_job();
        job.max_attempts = 3;

        job.attempt_count = 0;
        assert!(!job.is_final_attempt());
        job.attempt_count = 1;
        assert!(!job.is_final_attempt());
        job.attempt_count = 2;
        assert!(job.is_final_attempt());
    }

    #[test]
    fn claimable() {
        let now = Utc::now();
        let mut job = Job::raw_job();

        job.scheduled_at = now + TimeDelta::seconds(5);
        assert!(!job.is_claimable(now));

        job.scheduled_at = now - TimeDelta::seconds(5);
        assert!(job.is_claimable(now));

        job.status = JobStatus::Processing;
        job.locked_until = Some(now + TimeDelta::minutes(1));
        assert!(!job.is_claimable(now));

        job.locked_until = Some(now - TimeDelta::milliseconds(1));
        assert!(job.is_claimable(now));

        job.status = JobStatus::Completed;
        assert!(!job.is_claimable(now));
    }

    #[tokio::test]
    async fn panics_become_panic_failures() {
        let error = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        let failure = JobFailure::from(error);

        assert_eq!(failure.kind, FailureKind::Panic);
        assert_eq!(failure.message, "boom");
        assert!(failure.is_retryable());
    }
}
