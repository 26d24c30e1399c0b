//! Runtime configuration for a [`crate::Queue`].
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Settings shared by every worker a [`crate::Queue`] starts.
///
/// Every field has a default, so partial documents deserialize:
///
/// ```
/// # use jobqueue::config::QueueConfig;
/// let config: QueueConfig =
///     serde_json::from_str(r#"{"queues": ["critical", "default"], "poll_interval_ms": 250}"#)
///         .unwrap();
///
/// assert_eq!(config.queues, ["critical", "default"]);
/// assert_eq!(config.lease_duration_ms, 300_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queues polled by workers, in no particular order.
    pub queues: Vec<String>,
    pub poll_interval_ms: u64,
    /// How long a claim is exclusive before another worker may take the job over.
    pub lease_duration_ms: u64,
    /// Used when a job is enqueued without an explicit attempt limit.
    pub default_max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub worker_id_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_owned()],
            poll_interval_ms: 1_000,
            lease_duration_ms: 300_000,
            default_max_attempts: 3,
            backoff: BackoffPolicy::default(),
            worker_id_prefix: "worker".to_owned(),
        }
    }
}

impl QueueConfig {
    pub fn with_queues<I, S>(self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval_ms: u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX),
            ..self
        }
    }

    pub fn with_lease_duration(self, lease_duration: Duration) -> Self {
        Self {
            lease_duration_ms: u64::try_from(lease_duration.as_millis()).unwrap_or(u64::MAX),
            ..self
        }
    }

    pub fn with_default_max_attempts(self, default_max_attempts: u32) -> Self {
        Self {
            default_max_attempts,
            ..self
        }
    }

    pub fn with_backoff(self, backoff: BackoffPolicy) -> Self {
        Self { backoff, ..self }
    }

    pub fn with_worker_id_prefix(self, worker_id_prefix: impl Into<String>) -> Self {
        Self {
            worker_id_prefix: worker_id_prefix.into(),
            ..self
        }
    }

    /// Never zero, so a misconfigured interval does not spin.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn lease_duration(&self) -> TimeDelta {
        i64::try_from(self.lease_duration_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = QueueConfig::default();

        assert_eq!(config.queues, ["default"]);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.lease_duration(), TimeDelta::minutes(5));
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.backoff, BackoffPolicy::Fixed { delay_seconds: 300 });
    }

    #[test]
    fn empty_document_is_default() {
        let config: QueueConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn builders() {
        let config = QueueConfig::default()
            .with_queues(["critical", "low"])
            .with_poll_interval(Duration::from_millis(50))
            .with_lease_duration(Duration::from_secs(30))
            .with_default_max_attempts(7)
            .with_worker_id_prefix("mailer");

        assert_eq!(config.queues, ["critical", "low"]);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.lease_duration(), TimeDelta::seconds(30));
        assert_eq!(config.default_max_attempts, 7);
        assert_eq!(config.worker_id_prefix, "mailer");
    }

    #[test]
    fn sub_second_lease_is_kept() {
        let config = QueueConfig::default().with_lease_duration(Duration::from_millis(800));

        assert_eq!(config.lease_duration_ms, 800);
        assert_eq!(config.lease_duration(), TimeDelta::milliseconds(800));
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = QueueConfig::default().with_poll_interval(Duration::ZERO);

        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
