//! Re-exports of the types most users of a [`crate::Queue`] need.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobqueue::prelude::*;
//! ```
pub use crate::backend::memory::InMemoryBackend;
pub use crate::backend::{Backend, EnqueuableJob, Transition};
pub use crate::backoff::{BackoffPolicy, BackoffStrategy, Jitter, Strategy};
pub use crate::config::QueueConfig;
pub use crate::handler::{Executor, Handler, HandlerContext, HandlerError, HandlerRegistry};
pub use crate::job::options::JobOptions;
pub use crate::job::query::Where;
pub use crate::job::{FailureKind, Job, JobId, JobStatus};
pub use crate::manager::{JobStatusView, QueueManager};
pub use crate::stats::QueueStats;
pub use crate::{Queue, QueueError};
pub use tokio_util::sync::CancellationToken;
