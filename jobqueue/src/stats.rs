//! Per-queue, per-day counters.
use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

/// Aggregated counters for one queue on one UTC day.
///
/// Processing time is accumulated for every job that reaches `completed` or `failed` after
/// having been claimed, and the average is taken over those jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub date: NaiveDate,
    pub jobs_enqueued: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub total_processing_time_ms: i64,
    pub avg_processing_time_ms: f64,
}

/// An increment to apply to a [`QueueStats`] record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub jobs_enqueued: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub processing_time_ms: i64,
}

impl StatsDelta {
    pub const fn enqueued() -> Self {
        Self {
            jobs_enqueued: 1,
            jobs_completed: 0,
            jobs_failed: 0,
            processing_time_ms: 0,
        }
    }

    pub fn completed(processing_time: Option<TimeDelta>) -> Self {
        Self {
            jobs_completed: 1,
            processing_time_ms: Self::millis(processing_time),
            ..Self::default()
        }
    }

    pub fn failed(processing_time: Option<TimeDelta>) -> Self {
        Self {
            jobs_failed: 1,
            processing_time_ms: Self::millis(processing_time),
            ..Self::default()
        }
    }

    fn millis(processing_time: Option<TimeDelta>) -> i64 {
        processing_time
            .map(|elapsed| elapsed.num_milliseconds().max(0))
            .unwrap_or_default()
    }
}

impl QueueStats {
    pub fn empty(queue_name: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            queue_name: queue_name.into(),
            date,
            jobs_enqueued: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            total_processing_time_ms: 0,
            avg_processing_time_ms: 0.0,
        }
    }

    pub fn apply(&mut self, delta: StatsDelta) {
        self.jobs_enqueued += delta.jobs_enqueued;
        self.jobs_completed += delta.jobs_completed;
        self.jobs_failed += delta.jobs_failed;
        self.total_processing_time_ms += delta.processing_time_ms;
        self.avg_processing_time_ms =
            Self::average(self.total_processing_time_ms, self.finished());
    }

    /// Jobs that reached a terminal state through a worker.
    pub fn finished(&self) -> i64 {
        self.jobs_completed + self.jobs_failed
    }

    pub fn average(total_processing_time_ms: i64, finished: i64) -> f64 {
        if finished == 0 {
            0.0
        } else {
            total_processing_time_ms as f64 / finished as f64
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn apply_accumulates() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut stats = QueueStats::empty("default", date);

        stats.apply(StatsDelta::enqueued());
        stats.apply(StatsDelta::enqueued());
        stats.apply(StatsDelta::completed(Some(TimeDelta::milliseconds(300))));
        stats.apply(StatsDelta::failed(Some(TimeDelta::milliseconds(100))));

        assert_eq!(stats.jobs_enqueued, 2);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.total_processing_time_ms, 400);
        assert_eq!(stats.avg_processing_time_ms, 200.0);
    }

    #[test]
    fn unclaimed_failures_add_no_time() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut stats = QueueStats::empty("default", date);

        stats.apply(StatsDelta::failed(None));

        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.total_processing_time_ms, 0);
        assert_eq!(stats.avg_processing_time_ms, 0.0);
    }
}
