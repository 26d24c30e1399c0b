use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use jobqueue::{
    backend::{Backend, BackendError, EnqueuableJob, Query, Transition},
    job::{Document, Job, JobFailure, JobId},
    stats::{QueueStats, StatsDelta},
};
use serde_json::Value;
use sqlx::{prelude::FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    map_err,
    query::ToQuery,
    types::{JobRow, JobStatus, StatsRow, JOB_COLUMNS},
    PgBackend,
};

/// The fields of a locked job row that decide whether a transition applies.
#[derive(Debug, FromRow)]
struct LockedJob {
    status: JobStatus,
    queue_name: String,
    attempt_count: i32,
    max_attempts: i32,
    started_at: Option<DateTime<Utc>>,
}

impl LockedJob {
    fn skipped(&self) -> Result<Transition, BackendError> {
        Ok(Transition::Skipped {
            status: self.status.into(),
        })
    }

    fn processing_time(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.started_at.map(|started_at| now - started_at)
    }
}

fn signed(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl PgBackend {
    async fn lock(conn: &mut PgConnection, id: JobId) -> Result<LockedJob, BackendError> {
        sqlx::query_as::<_, LockedJob>(
            r#"SELECT status, queue_name, attempt_count, max_attempts, started_at
            FROM jobqueue_jobs
            WHERE id = $1
            FOR UPDATE"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_err)?
        .ok_or(BackendError::JobNotFound(id))
    }

    async fn record(
        conn: &mut PgConnection,
        queue_name: &str,
        date: NaiveDate,
        delta: StatsDelta,
    ) -> Result<(), BackendError> {
        sqlx::query(
            r#"INSERT INTO jobqueue_stats (
                queue_name,
                date,
                jobs_enqueued,
                jobs_completed,
                jobs_failed,
                total_processing_time_ms
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (queue_name, date) DO UPDATE SET
                jobs_enqueued = jobqueue_stats.jobs_enqueued + EXCLUDED.jobs_enqueued,
                jobs_completed = jobqueue_stats.jobs_completed + EXCLUDED.jobs_completed,
                jobs_failed = jobqueue_stats.jobs_failed + EXCLUDED.jobs_failed,
                total_processing_time_ms =
                    jobqueue_stats.total_processing_time_ms + EXCLUDED.total_processing_time_ms
            "#,
        )
        .bind(queue_name)
        .bind(date)
        .bind(delta.jobs_enqueued)
        .bind(delta.jobs_completed)
        .bind(delta.jobs_failed)
        .bind(delta.processing_time_ms)
        .execute(&mut *conn)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn insert_job(conn: &mut PgConnection, job: &Job) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"INSERT INTO jobqueue_jobs (
                id,
                queue_name,
                job_type,
                payload,
                priority,
                status,
                attempt_count,
                max_attempts,
                scheduled_at,
                created_at,
                updated_at,
                organization_id,
                user_id,
                timeout_seconds,
                metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(Uuid::from(job.id))
        .bind(&job.queue_name)
        .bind(&job.job_type)
        .bind(Value::Object(job.payload.clone()))
        .bind(job.priority)
        .bind(JobStatus::from(job.status))
        .bind(signed(job.max_attempts))
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .bind(job.organization_id)
        .bind(job.user_id)
        .bind(job.timeout_seconds.map(signed))
        .bind(Value::Object(job.metadata.clone()))
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(BackendError::DuplicateJob(job.id))
            }
            Err(error) => Err(map_err(error)),
        }
    }
}

#[async_trait]
impl Backend for PgBackend {
    #[instrument(skip_all, fields(queue = %job.queue_name, job_type = %job.job_type))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let now = Utc::now();
        let job = job.into_job(now)?;

        let mut tx = self.pool.begin().await.map_err(map_err)?;
        Self::insert_job(&mut tx, &job).await?;
        Self::record(&mut tx, &job.queue_name, now.date_naive(), StatsDelta::enqueued()).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(job.id)
    }

    #[instrument(skip(self, lease))]
    async fn claim(
        &self,
        worker_id: &str,
        queue_names: &[String],
        lease: TimeDelta,
    ) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let locked_until = now
            .checked_add_signed(lease)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let sql = format!(
            r#"UPDATE jobqueue_jobs
            SET
                status = 'processing',
                worker_id = $1,
                locked_at = $2,
                locked_until = $3,
                started_at = $2,
                updated_at = $2
            WHERE id = (
                SELECT id FROM jobqueue_jobs
                WHERE queue_name = ANY($4)
                AND scheduled_at <= $2
                AND (
                    status = 'pending'
                    OR (status = 'processing' AND locked_until < $2)
                )
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}"#
        );

        sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(locked_until)
            .bind(queue_names)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn mark_job_complete(
        &self,
        id: JobId,
        result: Document,
    ) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let job = Self::lock(&mut tx, id).await?;
        if job.status != JobStatus::Processing {
            return job.skipped();
        }

        sqlx::query(
            r#"UPDATE jobqueue_jobs
            SET
                status = 'completed',
                result = $2,
                completed_at = $3,
                updated_at = $3,
                worker_id = NULL,
                locked_at = NULL,
                locked_until = NULL
            WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .bind(Value::Object(result))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        let delta = StatsDelta::completed(job.processing_time(now));
        Self::record(&mut tx, &job.queue_name, now.date_naive(), delta).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(Transition::Applied)
    }

    async fn mark_job_failed(
        &self,
        id: JobId,
        failure: JobFailure,
    ) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let job = Self::lock(&mut tx, id).await?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return job.skipped();
        }

        sqlx::query(
            r#"UPDATE jobqueue_jobs
            SET
                status = 'failed',
                error_message = $2,
                error_kind = $3,
                completed_at = $4,
                updated_at = $4,
                worker_id = NULL,
                locked_at = NULL,
                locked_until = NULL
            WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .bind(&failure.message)
        .bind(failure.kind.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        let processing_time = job
            .processing_time(now)
            .filter(|_| job.status == JobStatus::Processing);
        let delta = StatsDelta::failed(processing_time);
        Self::record(&mut tx, &job.queue_name, now.date_naive(), delta).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(Transition::Applied)
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let job = Self::lock(&mut tx, id).await?;
        if job.status != JobStatus::Processing || job.attempt_count >= job.max_attempts {
            return job.skipped();
        }

        sqlx::query(
            r#"UPDATE jobqueue_jobs
            SET
                status = 'pending',
                attempt_count = attempt_count + 1,
                scheduled_at = $2,
                updated_at = $3,
                worker_id = NULL,
                locked_at = NULL,
                locked_until = NULL
            WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .bind(next_scheduled_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(Transition::Applied)
    }

    async fn mark_job_cancelled(&self, id: JobId) -> Result<Transition, BackendError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let job = Self::lock(&mut tx, id).await?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return job.skipped();
        }

        sqlx::query(
            r#"UPDATE jobqueue_jobs
            SET
                status = 'cancelled',
                updated_at = $2,
                worker_id = NULL,
                locked_at = NULL,
                locked_until = NULL
            WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(Transition::Applied)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobqueue_jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn queue_stats(
        &self,
        queue_name: &str,
        date: NaiveDate,
    ) -> Result<QueueStats, BackendError> {
        let stats = sqlx::query_as::<_, StatsRow>(
            r#"SELECT
                queue_name,
                date,
                jobs_enqueued,
                jobs_completed,
                jobs_failed,
                total_processing_time_ms
            FROM jobqueue_stats
            WHERE queue_name = $1 AND date = $2"#,
        )
        .bind(queue_name)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(stats
            .map(QueueStats::from)
            .unwrap_or_else(|| QueueStats::empty(queue_name, date)))
    }

    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError> {
        query
            .query()
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }
}
