use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{JobId, JobOptions, JobPriority, WorkerId};
use crate::backoff::BackoffPolicy;

/// Job status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Ready to be claimed
    Waiting,

    /// Not eligible until `delay_until` (initial delay or retry backoff)
    Delayed,

    /// Claimed by a worker
    Active,

    Completed,

    /// Attempts exhausted or permanent error; never claimed again
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get the status name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn all() -> [JobStatus; 5] {
        [Self::Waiting, Self::Delayed, Self::Active, Self::Completed, Self::Failed]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Job record - the unit of work as stored by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,

    /// Owning queue
    pub queue: String,

    /// Discriminator telling the processor which operation to run
    pub job_type: String,

    /// Opaque processor input; never inspected by the queue core
    pub payload: Value,

    pub status: JobStatus,

    /// Failed attempts so far
    pub attempts: u32,

    pub max_attempts: u32,

    pub backoff: BackoffPolicy,

    pub priority: JobPriority,

    /// Earliest time the job may be claimed
    pub delay_until: Option<DateTime<Utc>>,

    /// Per-invocation timeout in milliseconds
    pub timeout_ms: Option<u64>,

    pub remove_on_complete: bool,

    pub remove_on_fail: bool,

    pub created_at: DateTime<Utc>,

    /// When the current or last attempt started
    pub processed_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub failed_at: Option<DateTime<Utc>>,

    /// Kept after a successful retry for diagnostics
    pub last_error: Option<String>,

    /// Worker holding the job while active
    pub worker_id: Option<WorkerId>,

    /// Active jobs whose lock lapses without renewal are reported as stalled
    pub lock_until: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a new record with options already resolved against queue defaults
    pub fn new(
        id: JobId,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: Value,
        options: &JobOptions,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        let now = Utc::now();
        let delay_until = options
            .delay
            .filter(|delay| !delay.is_zero())
            .map(|delay| later_by(now, delay));

        Self {
            id,
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            status: if delay_until.is_some() { JobStatus::Delayed } else { JobStatus::Waiting },
            attempts: 0,
            max_attempts,
            backoff,
            priority: options.priority,
            delay_until,
            timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            created_at: now,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            worker_id: None,
            lock_until: None,
        }
    }

    /// Check if another failure would still leave attempts to retry with
    pub fn can_retry(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Terminal timestamp used by cleanup
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Completed => self.completed_at,
            JobStatus::Failed => self.failed_at,
            _ => None,
        }
    }

    /// Mark claimed by a worker
    pub fn activate(&mut self, worker: Option<WorkerId>, lock_until: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.processed_at = Some(Utc::now());
        self.delay_until = None;
        self.worker_id = worker;
        self.lock_until = Some(lock_until);
    }

    /// Complete the job successfully
    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.worker_id = None;
        self.lock_until = None;
    }

    /// Count a failed attempt and park the job until `retry_at`
    pub fn schedule_retry(&mut self, error: String, retry_at: DateTime<Utc>) {
        self.attempts += 1;
        self.status = JobStatus::Delayed;
        self.delay_until = Some(retry_at);
        self.last_error = Some(error);
        self.worker_id = None;
        self.lock_until = None;
    }

    /// Count a failed attempt and fail the job permanently
    pub fn fail(&mut self, error: String) {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.status = JobStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.last_error = Some(error);
        self.worker_id = None;
        self.lock_until = None;
    }
}

/// `at + duration`, clamped to the last second of year 9999.
///
/// Records are serialized as RFC 3339, which has no room for larger years.
pub(crate) fn later_by(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let horizon = far_future();
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .map_or(horizon, |later| later.min(horizon))
}

/// `at - duration`, clamped to the earliest representable instant
pub(crate) fn earlier_by(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Job counts per status for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Delayed => self.delayed,
            JobStatus::Active => self.active,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}
