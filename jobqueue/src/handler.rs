//! Job handlers and the per-queue registry that dispatches to them.
//!
//! A handler is anything implementing [`Handler`]; async closures taking a [`HandlerContext`]
//! and the raw payload bytes qualify directly. For typed payloads implement [`Executor`] and
//! register it with [`crate::Queue::with_executor`].
use std::{
    collections::HashMap, error::Error as StdError, future::Future, marker::PhantomData, sync::Arc,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::job::{Job, JobId};

/// Information about the job being handled.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: JobId,
    pub job_type: String,
    pub queue_name: String,
    /// Attempts already consumed before this one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker_id: String,
    shutdown: CancellationToken,
}

impl HandlerContext {
    pub(crate) fn new(job: &Job, worker_id: &str, shutdown: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue_name: job.queue_name.clone(),
            attempt: job.attempt_count,
            max_attempts: job.max_attempts,
            worker_id: worker_id.to_owned(),
            shutdown,
        }
    }

    /// True once the queue has been asked to stop.
    ///
    /// Handlers are never aborted; long running ones may check this to finish early.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves when the queue has been asked to stop.
    pub fn shutdown(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }
}

/// A failed handler invocation. All handler errors are retried while attempts remain.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(self, source: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            source: Some(Box::new(source)),
            ..self
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(format!("failed to decode payload: {error}")).with_source(error)
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: HandlerContext, payload: Vec<u8>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, payload: Vec<u8>) -> Result<(), HandlerError> {
        (self)(ctx, payload).await
    }
}

/// A handler with a typed payload.
///
/// # Example
///
/// ```
/// # use jobqueue::prelude::*;
/// # use serde::Deserialize;
/// #[derive(Deserialize)]
/// struct Welcome {
///     to: String,
/// }
///
/// struct WelcomeEmail;
///
/// #[async_trait::async_trait]
/// impl Executor for WelcomeEmail {
///     type Data = Welcome;
///     const NAME: &'static str = "user.welcome";
///
///     async fn execute(_ctx: HandlerContext, data: Self::Data) -> Result<(), HandlerError> {
///         if data.to.is_empty() {
///             return Err("missing recipient".into());
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    type Data: DeserializeOwned + Send;

    /// The job type this executor handles.
    const NAME: &'static str;

    async fn execute(ctx: HandlerContext, data: Self::Data) -> Result<(), HandlerError>;
}

/// Adapts an [`Executor`] to [`Handler`], decoding the payload first.
pub(crate) struct ExecutorHandler<E>(PhantomData<fn() -> E>);

impl<E> ExecutorHandler<E> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<E: Executor> Handler for ExecutorHandler<E> {
    async fn handle(&self, ctx: HandlerContext, payload: Vec<u8>) -> Result<(), HandlerError> {
        let data: E::Data = serde_json::from_slice(&payload)?;
        E::execute(ctx, data).await
    }
}

/// Maps job types to handlers. Registering a type twice replaces the first handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handler previously registered for `job_type`, if any.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: impl Handler,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(job_type.into(), Arc::new(handler))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut job_types: Vec<&str> = self.job_types().collect();
        job_types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("job_types", &job_types)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;

    fn context() -> HandlerContext {
        HandlerContext::new(&Job::raw_job(), "worker-1", CancellationToken::new())
    }

    #[derive(Deserialize)]
    struct Welcome {
        to: String,
    }

    struct WelcomeEmail;

    #[async_trait]
    impl Executor for WelcomeEmail {
        type Data = Welcome;
        const NAME: &'static str = "user.welcome";

        async fn execute(_ctx: HandlerContext, data: Self::Data) -> Result<(), HandlerError> {
            if data.to.is_empty() {
                return Err("missing recipient".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register("email.send", {
            let calls = calls.clone();
            move |ctx: HandlerContext, payload: Vec<u8>| {
                let calls = calls.clone();
                async move {
                    assert_eq!(ctx.worker_id, "worker-1");
                    assert_eq!(payload, b"{}");
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(())
                }
            }
        });

        let handler = registry.get("email.send").unwrap();
        handler.handle(context(), b"{}".to_vec()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get("email.bounce").is_none());
    }

    #[tokio::test]
    async fn register_replaces() {
        let mut registry = HandlerRegistry::new();
        let previous = registry.register("report", |_: HandlerContext, _: Vec<u8>| async {
            Ok::<_, HandlerError>(())
        });
        assert!(previous.is_none());

        let previous = registry.register("report", |_: HandlerContext, _: Vec<u8>| async {
            Err::<(), _>(HandlerError::new("second"))
        });
        assert!(previous.is_some());
        assert_eq!(registry.len(), 1);

        let error = registry
            .get("report")
            .unwrap()
            .handle(context(), vec![])
            .await
            .unwrap_err();
        assert_eq!(error.message(), "second");
    }

    #[tokio::test]
    async fn executor_decodes_payload() {
        let handler = ExecutorHandler::<WelcomeEmail>::new();

        assert_matches!(
            handler
                .handle(context(), br#"{"to": "a@b.com"}"#.to_vec())
                .await,
            Ok(())
        );

        let error = handler
            .handle(context(), br#"{"to": ""}"#.to_vec())
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "missing recipient");

        let error = handler
            .handle(context(), br#"{"recipient": 1}"#.to_vec())
            .await
            .unwrap_err();
        assert!(error.message().starts_with("failed to decode payload"));
        assert!(StdError::source(&error).is_some());
    }

    #[test]
    fn context_reflects_shutdown() {
        let token = CancellationToken::new();
        let ctx = HandlerContext::new(&Job::raw_job(), "worker-1", token.clone());

        assert!(!ctx.is_shutting_down());
        token.cancel();
        assert!(ctx.is_shutting_down());
    }
}
