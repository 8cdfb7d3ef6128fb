use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobCounts;

/// Monotonic per-queue event counters, updated as jobs change state
#[derive(Debug, Default)]
pub struct QueueCounters {
    enqueued: AtomicU64,
    processing: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    stalled: AtomicU64,
}

impl QueueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was claimed and handed to a processor
    pub fn increment_processing(&self) {
        self.processing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A job failed permanently
    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stalled(&self) {
        self.stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processing: self.processing.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueueCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub enqueued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stalled: u64,
}

impl CounterSnapshot {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.completed + self.failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.completed as f64 / total_processed as f64) * 100.0
        }
    }

    /// Calculate retry rate as percentage of enqueued jobs
    pub fn retry_rate(&self) -> f64 {
        if self.enqueued == 0 {
            0.0
        } else {
            (self.retried as f64 / self.enqueued as f64) * 100.0
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> {
        [
            ("enqueued", self.enqueued),
            ("processing", self.processing),
            ("completed", self.completed),
            ("failed", self.failed),
            ("retried", self.retried),
            ("stalled", self.stalled),
        ]
        .into_iter()
    }
}

/// Sampled view of one queue. Derived from the broker, never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub queue: String,
    pub counts: JobCounts,
    pub counters: CounterSnapshot,
    pub sampled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = QueueCounters::new();
        counters.increment_enqueued();
        counters.increment_enqueued();
        counters.increment_processing();
        counters.increment_completed();
        counters.increment_retried();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.processing, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.success_rate(), 100.0);
        assert_eq!(snapshot.retry_rate(), 50.0);
    }

    #[test]
    fn rates() {
        let snapshot = CounterSnapshot {
            enqueued: 100,
            processing: 95,
            completed: 80,
            failed: 10,
            retried: 5,
            stalled: 0,
        };

        assert_eq!(snapshot.success_rate(), 88.88888888888889); // 80/(80+10) * 100
        assert_eq!(snapshot.retry_rate(), 5.0);
        assert_eq!(snapshot.iter().count(), 6);
    }
}
