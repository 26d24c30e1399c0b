use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::backend::EnqueuableJob;

use super::{Document, ValidationError};

/// Producer-facing options for enqueuing a job through [`crate::manager::QueueManager`].
///
/// ```
/// # use jobqueue::job::options::JobOptions;
/// # use chrono::TimeDelta;
/// let options = JobOptions::default()
///     .with_priority(10)
///     .with_delay(TimeDelta::seconds(30))
///     .with_max_retries(5);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    priority: i32,
    delay: Option<TimeDelta>,
    scheduled_at: Option<DateTime<Utc>>,
    max_retries: Option<u32>,
    timeout: Option<Duration>,
    metadata: Document,
    organization_id: Option<Uuid>,
    user_id: Option<Uuid>,
}

impl JobOptions {
    /// Higher priorities are claimed first among due jobs.
    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    /// Run the job no earlier than `delay` from the time of enqueuing.
    ///
    /// Cannot be combined with [`JobOptions::schedule_at`].
    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// Run the job no earlier than `scheduled_at`.
    ///
    /// Cannot be combined with [`JobOptions::with_delay`].
    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    /// The total number of attempts the job is given. Defaults to the queue's configured
    /// default.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    /// Stored alongside the job. Handlers are not interrupted when it elapses.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_metadata(self, metadata: Document) -> Self {
        Self { metadata, ..self }
    }

    pub fn add_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
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

    pub(crate) fn resolve_scheduled_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        match (self.delay, self.scheduled_at) {
            (Some(_), Some(_)) => Err(ValidationError::ConflictingSchedule),
            (Some(delay), None) if delay < TimeDelta::zero() => Err(ValidationError::NegativeDelay),
            (Some(delay), None) => Ok(now
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)),
            (None, Some(scheduled_at)) => Ok(scheduled_at),
            (None, None) => Ok(now),
        }
    }

    pub(crate) fn into_enqueuable(
        self,
        queue_name: &str,
        job_type: &str,
        payload: Value,
        default_max_attempts: u32,
    ) -> Result<EnqueuableJob, ValidationError> {
        let scheduled_at = self.resolve_scheduled_at(Utc::now())?;
        Ok(EnqueuableJob {
            id: None,
            queue_name: queue_name.to_owned(),
            job_type: job_type.to_owned(),
            payload,
            metadata: Value::Object(self.metadata),
            priority: self.priority,
            max_attempts: self.max_retries.unwrap_or(default_max_attempts),
            scheduled_at,
            organization_id: self.organization_id,
            user_id: self.user_id,
            timeout_seconds: self
                .timeout
                .map(|timeout| u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn defaults() {
        let job = JobOptions::default()
            .into_enqueuable("default", "email.send", json!({"to": "a@b.com"}), 3)
            .unwrap();

        assert_eq!(job.priority, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.scheduled_at <= Utc::now());
        assert_eq!(job.metadata, json!({}));
        assert_eq!(job.timeout_seconds, None);
    }

    #[test]
    fn delay_is_relative_to_now() {
        let before = Utc::now();
        let job = JobOptions::default()
            .with_delay(TimeDelta::minutes(10))
            .into_enqueuable("default", "report", json!({}), 3)
            .unwrap();

        assert!(job.scheduled_at >= before + TimeDelta::minutes(10));
        assert!(job.scheduled_at <= Utc::now() + TimeDelta::minutes(10));
    }

    #[test]
    fn delay_and_scheduled_at_conflict() {
        let result = JobOptions::default()
            .with_delay(TimeDelta::minutes(10))
            .schedule_at(Utc::now())
            .into_enqueuable("default", "report", json!({}), 3);

        assert_matches!(result, Err(ValidationError::ConflictingSchedule));
    }

    #[test]
    fn negative_delay_rejected() {
        let result = JobOptions::default()
            .with_delay(TimeDelta::seconds(-1))
            .into_enqueuable("default", "report", json!({}), 3);

        assert_matches!(result, Err(ValidationError::NegativeDelay));
    }

    #[test]
    fn all_options_carried_over() {
        let organization_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let scheduled_at = Utc::now() + TimeDelta::hours(1);

        let job = JobOptions::default()
            .with_priority(7)
            .schedule_at(scheduled_at)
            .with_max_retries(5)
            .with_timeout(Duration::from_secs(90))
            .add_metadata("source", "import")
            .with_organization_id(organization_id)
            .with_user_id(user_id)
            .into_enqueuable("low", "contacts.import", json!({"file": "a.csv"}), 3)
            .unwrap();

        assert_eq!(job.queue_name, "low");
        assert_eq!(job.job_type, "contacts.import");
        assert_eq!(job.priority, 7);
        assert_eq!(job.scheduled_at, scheduled_at);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.timeout_seconds, Some(90));
        assert_eq!(job.metadata, json!({"source": "import"}));
        assert_eq!(job.organization_id, Some(organization_id));
        assert_eq!(job.user_id, Some(user_id));
    }
}
