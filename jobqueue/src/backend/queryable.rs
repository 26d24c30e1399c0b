use serde_json::Value;

use crate::job::Job;

use super::Query;

pub(crate) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for Query {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::IdEquals(id) => job.id == *id,
            Query::QueueEqual(queue_name) => job.queue_name == *queue_name,
            Query::JobTypeEqual(job_type) => job.job_type == *job_type,
            Query::StatusEqual(status) => job.status == *status,
            Query::PayloadEquals(Value::Object(payload)) => job.payload == *payload,
            Query::PayloadEquals(_) => false,
            Query::OrganizationEqual(organization_id) => {
                job.organization_id == Some(*organization_id)
            }
            Query::ScheduledAtBefore(scheduled_at) => job.scheduled_at < *scheduled_at,
            Query::ScheduledAtAfter(scheduled_at) => job.scheduled_at > *scheduled_at,
        }
    }
}
