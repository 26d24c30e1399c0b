use chrono::{DateTime, NaiveDate, Utc};
use jobqueue::{
    backend::BackendError,
    job::{json_kind, Document, FailureKind, Job, ValidationError},
    stats::QueueStats,
};
use serde_json::Value;
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobqueue_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl From<JobStatus> for jobqueue::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Processing => Self::Processing,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<jobqueue::job::JobStatus> for JobStatus {
    fn from(value: jobqueue::job::JobStatus) -> Self {
        match value {
            jobqueue::job::JobStatus::Pending => Self::Pending,
            jobqueue::job::JobStatus::Processing => Self::Processing,
            jobqueue::job::JobStatus::Completed => Self::Completed,
            jobqueue::job::JobStatus::Failed => Self::Failed,
            jobqueue::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

pub(crate) const JOB_COLUMNS: &str = "id, queue_name, job_type, payload, result, error_message, \
    error_kind, priority, status, attempt_count, max_attempts, worker_id, locked_at, \
    locked_until, scheduled_at, created_at, started_at, completed_at, updated_at, \
    organization_id, user_id, timeout_seconds, metadata";

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
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
    pub timeout_seconds: Option<i32>,
    pub metadata: Value,
}

fn document(value: Value) -> Result<Document, BackendError> {
    match value {
        Value::Object(document) => Ok(document),
        Value::Null => Ok(Document::new()),
        other => Err(ValidationError::MalformedPayload(json_kind(&other)).into()),
    }
}

fn unsigned(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

impl TryFrom<JobRow> for Job {
    type Error = BackendError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let error_kind = value
            .error_kind
            .as_deref()
            .map(str::parse::<FailureKind>)
            .transpose()
            .map_err(|error| BackendError::Database(error.to_string()))?;
        Ok(Self {
            id: value.id.into(),
            queue_name: value.queue_name,
            job_type: value.job_type,
            payload: document(value.payload)?,
            result: value.result.map(document).transpose()?,
            error_message: value.error_message,
            error_kind,
            priority: value.priority,
            status: value.status.into(),
            attempt_count: unsigned(value.attempt_count),
            max_attempts: unsigned(value.max_attempts),
            worker_id: value.worker_id,
            locked_at: value.locked_at,
            locked_until: value.locked_until,
            scheduled_at: value.scheduled_at,
            created_at: value.created_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
            updated_at: value.updated_at,
            organization_id: value.organization_id,
            user_id: value.user_id,
            timeout_seconds: value.timeout_seconds.map(unsigned),
            metadata: document(value.metadata)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct StatsRow {
    pub queue_name: String,
    pub date: NaiveDate,
    pub jobs_enqueued: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub total_processing_time_ms: i64,
}

impl From<StatsRow> for QueueStats {
    fn from(value: StatsRow) -> Self {
        let finished = value.jobs_completed + value.jobs_failed;
        Self {
            avg_processing_time_ms: QueueStats::average(value.total_processing_time_ms, finished),
            queue_name: value.queue_name,
            date: value.date,
            jobs_enqueued: value.jobs_enqueued,
            jobs_completed: value.jobs_completed,
            jobs_failed: value.jobs_failed,
            total_processing_time_ms: value.total_processing_time_ms,
        }
    }
}
