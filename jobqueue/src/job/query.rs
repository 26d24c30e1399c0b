use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::backend::Query;

use super::{JobId, JobStatus};

/// Builder for filtering stored jobs.
///
/// ```
/// # use jobqueue::job::{query::Where, JobStatus};
/// let query = Where::queue_equals("critical")
///     .and(Where::status_equal(JobStatus::Failed).or(Where::status_equal(JobStatus::Cancelled)))
///     .and(!Where::job_type_equals("email.send"));
/// ```
#[derive(Debug, PartialEq, Clone)]
#[non_exhaustive]
pub struct Where(pub(crate) Query);

impl Where {
    pub fn and(mut self, other: Where) -> Self {
        if let Query::And(ref mut constraints) = self.0 {
            constraints.push(other.0);
        } else {
            self.0 = Query::And(vec![self.0, other.0]);
        }
        self
    }

    pub fn or(mut self, other: Where) -> Self {
        if let Query::Or(ref mut constraints) = self.0 {
            constraints.push(other.0);
        } else {
            self.0 = Query::Or(vec![self.0, other.0]);
        }
        self
    }

    /// Matches every job.
    pub fn all() -> Self {
        Self(Query::And(vec![]))
    }

    pub fn id_equals(id: JobId) -> Self {
        Self(Query::IdEquals(id))
    }

    pub fn queue_equals(queue_name: impl Into<String>) -> Self {
        Self(Query::QueueEqual(queue_name.into()))
    }

    pub fn job_type_equals(job_type: impl Into<String>) -> Self {
        Self(Query::JobTypeEqual(job_type.into()))
    }

    pub fn status_equal(status: JobStatus) -> Self {
        Self(Query::StatusEqual(status))
    }

    /// Matches jobs whose payload serializes to exactly `payload`.
    pub fn payload_equals(payload: impl serde::Serialize) -> Result<Self, serde_json::Error> {
        serde_json::to_value(payload).map(|payload| Self(Query::PayloadEquals(payload)))
    }

    pub fn organization_equals(organization_id: Uuid) -> Self {
        Self(Query::OrganizationEqual(organization_id))
    }

    pub fn scheduled_at_before(scheduled_at: DateTime<Utc>) -> Self {
        Self(Query::ScheduledAtBefore(scheduled_at))
    }

    pub fn scheduled_at_after(scheduled_at: DateTime<Utc>) -> Self {
        Self(Query::ScheduledAtAfter(scheduled_at))
    }
}

impl std::ops::Not for Where {
    type Output = Self;
    fn not(self) -> Self {
        Self(Query::Not(Box::new(self.0)))
    }
}

impl From<Where> for Query {
    fn from(value: Where) -> Self {
        value.0
    }
}
