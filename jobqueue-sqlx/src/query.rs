use jobqueue::backend::Query;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::types::{JobStatus, JOB_COLUMNS};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for Query {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobqueue_jobs WHERE"));
        handle_query(&mut builder, self);
        builder.push(" ORDER BY created_at DESC");
        builder
    }
}

fn handle_query<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a Query) {
    match query {
        Query::Not(inner) => {
            builder.push(" NOT");
            handle_query(builder, inner);
        }
        Query::And(queries) => join(builder, queries, " AND", " TRUE"),
        Query::Or(queries) => join(builder, queries, " OR", " FALSE"),
        Query::IdEquals(id) => {
            builder.push(" id = ");
            builder.push_bind(Uuid::from(*id));
        }
        Query::QueueEqual(queue_name) => {
            builder.push(" queue_name = ");
            builder.push_bind(queue_name);
        }
        Query::JobTypeEqual(job_type) => {
            builder.push(" job_type = ");
            builder.push_bind(job_type);
        }
        Query::StatusEqual(status) => {
            builder.push(" status = ");
            builder.push_bind(JobStatus::from(*status));
        }
        Query::PayloadEquals(payload) => {
            builder.push(" payload = ");
            builder.push_bind(payload);
        }
        Query::OrganizationEqual(organization_id) => {
            builder.push(" organization_id = ");
            builder.push_bind(organization_id);
        }
        Query::ScheduledAtBefore(scheduled_at) => {
            builder.push(" scheduled_at < ");
            builder.push_bind(scheduled_at);
        }
        Query::ScheduledAtAfter(scheduled_at) => {
            builder.push(" scheduled_at > ");
            builder.push_bind(scheduled_at);
        }
    }
}

fn join<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    queries: &'a [Query],
    separator: &str,
    empty: &str,
) {
    let Some((last, elements)) = queries.split_last() else {
        builder.push(empty);
        return;
    };
    builder.push(" (");
    elements.iter().for_each(|query| {
        handle_query(builder, query);
        builder.push(separator);
    });
    handle_query(builder, last);
    builder.push(")");
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use jobqueue::job::{query::Where, JobStatus};

    use super::*;

    fn sql(query: Query) -> String {
        query
            .query()
            .sql()
            .trim_start_matches(&format!("SELECT {JOB_COLUMNS} FROM jobqueue_jobs WHERE"))
            .to_owned()
    }

    #[test]
    fn empty_queries() {
        assert_eq!(sql(Query::And(vec![])), " TRUE ORDER BY created_at DESC");
        assert_eq!(sql(Query::Or(vec![])), " FALSE ORDER BY created_at DESC");
    }

    #[test]
    fn nested_queries() {
        let query = Where::queue_equals("default")
            .and(Where::status_equal(JobStatus::Failed).or(Where::status_equal(JobStatus::Cancelled)))
            .and(!Where::scheduled_at_before(Utc::now()))
            .into();

        assert_eq!(
            sql(query),
            " ( queue_name = $1 AND ( status = $2 OR status = $3) AND NOT scheduled_at < $4) \
            ORDER BY created_at DESC"
        );
    }
}
