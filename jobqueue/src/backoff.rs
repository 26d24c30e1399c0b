//! Delays applied before a failed job becomes eligible again.
//!
//! Three strategies are provided, constant, linear and exponential, each of which can be
//! modified by applying jitter and a lower bound. [`BackoffPolicy`] is the serializable form
//! used by [`crate::config::QueueConfig`].
//!
//! # Example
//!
//! ```
//! # use jobqueue::prelude::*;
//! # use chrono::TimeDelta;
//! // 30s, 60s, 120s, ... capped at an hour, each spread by up to a fifth either way.
//! let retries = BackoffStrategy::exponential(TimeDelta::seconds(30))
//!     .with_max(TimeDelta::hours(1))
//!     .with_jitter(Jitter::Relative(0.2))
//!     .with_min(TimeDelta::seconds(30));
//!
//! let first = retries.backoff(1);
//! assert!(first >= TimeDelta::seconds(30) && first <= TimeDelta::seconds(36));
//! // Jitter is applied after the cap.
//! assert!(retries.backoff(12) <= TimeDelta::minutes(72));
//! ```
use chrono::TimeDelta;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Computes the delay before a retry.
pub trait Strategy: Send + Sync {
    /// Given the number of the attempt about to be made (starting at 1 for the first retry)
    /// returns the [`TimeDelta`] to wait before the job is eligible again.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Always returns the same delay.
///
/// Constructed via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// Grows by `factor` with each attempt.
///
/// Constructed via [`BackoffStrategy::linear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let backoff = i32::try_from(attempt)
            .ok()
            .and_then(|attempt| self.factor.checked_mul(attempt))
            .unwrap_or(TimeDelta::MAX);
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// Doubles with each attempt, starting at `base`.
///
/// Constructed via [`BackoffStrategy::exponential`].
///
/// ```
/// # use jobqueue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let backoff = 2_i32
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .unwrap_or(TimeDelta::MAX);
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// Random spread added to a delay so retries of many jobs failing together do not align.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// A random jitter as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round().abs() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(jitter))
            .unwrap_or(value)
    }
}

/// A [`Strategy`] with optional jitter and a lower bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// ```
    /// # use jobqueue::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::minutes(5));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::minutes(5));
    /// assert_eq!(strategy.backoff(3), TimeDelta::minutes(5));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Linear> {
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the value returned by [`Strategy::backoff`] to `max_delay`, before jitter.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the value returned by [`Strategy::backoff`] to `max_delay`, before jitter.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Never return less than `min`, whatever the jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);
        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }
        backoff.max(self.min)
    }
}

/// Configurable retry delay.
///
/// Deserializes from a tagged object, for example
/// `{"kind": "exponential", "base_seconds": 10, "max_seconds": 3600}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        delay_seconds: i64,
    },
    Linear {
        step_seconds: i64,
        max_seconds: Option<i64>,
    },
    Exponential {
        base_seconds: i64,
        max_seconds: Option<i64>,
    },
}

impl Default for BackoffPolicy {
    /// A fixed five minute delay.
    fn default() -> Self {
        Self::Fixed { delay_seconds: 300 }
    }
}

impl Strategy for BackoffPolicy {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let seconds = |seconds: i64| TimeDelta::try_seconds(seconds).unwrap_or(TimeDelta::MAX);
        match *self {
            Self::Fixed { delay_seconds } => {
                BackoffStrategy::constant(seconds(delay_seconds)).backoff(attempt)
            }
            Self::Linear {
                step_seconds,
                max_seconds,
            } => {
                let strategy = BackoffStrategy::linear(seconds(step_seconds));
                match max_seconds {
                    Some(max) => strategy.with_max(seconds(max)).backoff(attempt),
                    None => strategy.backoff(attempt),
                }
            }
            Self::Exponential {
                base_seconds,
                max_seconds,
            } => {
                let strategy = BackoffStrategy::exponential(seconds(base_seconds));
                match max_seconds {
                    Some(max) => strategy.with_max(seconds(max)).backoff(attempt),
                    None => strategy.backoff(attempt),
                }
            }
        }
    }
}
