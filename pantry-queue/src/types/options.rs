use std::time::Duration;

use super::{JobId, JobPriority};
use crate::backoff::BackoffPolicy;

/// Per-job enqueue options. Unset fields fall back to the queue's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub priority: JobPriority,

    /// Keep the job `delayed` until this much time has passed
    pub delay: Option<Duration>,

    /// Maximum attempts, overriding the queue default
    pub attempts: Option<u32>,

    /// Backoff policy, overriding the queue default
    pub backoff: Option<BackoffPolicy>,

    /// Caller-chosen id; enqueueing an id that already exists returns the existing job
    pub job_id: Option<JobId>,

    /// Delete the record as soon as the job completes
    pub remove_on_complete: bool,

    /// Delete the record as soon as the job fails permanently
    pub remove_on_fail: bool,

    /// Upper bound on a single processor invocation
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = remove;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
