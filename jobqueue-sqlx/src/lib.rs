//! A Postgres [`Backend`](jobqueue::backend::Backend) for `jobqueue`.
//!
//! Jobs are claimed with a single `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP LOCKED)`
//! statement, so any number of workers in any number of processes may share one database.
//! Every other transition locks the job row, applies the change and updates the day's
//! statistics in one transaction.
//!
//! ```no_run
//! # use jobqueue::prelude::*;
//! # use jobqueue_sqlx::PgBackend;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = PgBackend::from_db_url("postgresql://localhost/jobs").await?;
//! let queue = Queue::new(backend);
//! # Ok(())
//! # }
//! ```
use std::ops::Deref;

use jobqueue::backend::BackendError;
use sqlx::{postgres::PgPoolOptions, PgPool};

mod backend;
mod query;
mod types;

/// Applies the bundled migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: PgPool,
}

impl Deref for PgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// Wraps a pool whose database has already been migrated.
impl From<PgPool> for PgBackend {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgBackend {
    /// Connects to `db_url` and runs the migrations.
    pub async fn from_db_url(db_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .connect(db_url)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Runs the migrations against `pool` before wrapping it.
    pub async fn from_pool(pool: PgPool) -> Result<Self, BackendError> {
        MIGRATOR.run(&pool).await.map_err(|error| {
            tracing::error!(?error, "Failed to run jobqueue migrations");
            BackendError::Database(error.to_string())
        })?;
        Ok(Self { pool })
    }
}

fn map_err(error: sqlx::Error) -> BackendError {
    BackendError::Database(error.to_string())
}
