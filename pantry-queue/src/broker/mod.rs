pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::{
    QueueResult, JobId, JobRecord, JobStatus, JobCounts,
    types::WorkerId,
};

pub use memory::MemoryBroker;

#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// How an active job leaves the `active` set
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Processor succeeded
    Completed,

    /// Processor failed. The broker counts the attempt and either parks the
    /// job in `delayed` for its backoff or fails it permanently.
    Failed {
        error: String,
        /// `false` skips remaining attempts
        retryable: bool,
        /// Upper bound on the computed backoff delay
        backoff_cap: Option<Duration>,
    },
}

/// Storage primitives for the queue core.
///
/// Every state transition is atomic at the broker level: a job is claimed by
/// at most one caller, and a job is settled at most once per claim.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Next value of the monotonic job id counter
    async fn next_id(&self) -> QueueResult<JobId>;

    /// Persist a new job in `waiting` or `delayed`.
    ///
    /// If a job with the same id already exists in the queue it is returned
    /// unchanged together with `false`.
    async fn add(&self, job: JobRecord) -> QueueResult<(JobRecord, bool)>;

    /// Claim the next eligible job: highest priority first, FIFO within a
    /// priority, delayed jobs only once their time has come.
    async fn claim(
        &self,
        queue: &str,
        worker: &WorkerId,
        lock_for: Duration,
    ) -> QueueResult<Option<JobRecord>>;

    /// Move an active job out of `active`. Returns `None` if the job is not
    /// currently active, which makes repeated settlement a no-op.
    async fn settle(
        &self,
        queue: &str,
        job_id: &JobId,
        settlement: Settlement,
    ) -> QueueResult<Option<JobRecord>>;

    /// Renew the lock of an active job held by `worker`
    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        worker: &WorkerId,
        lock_for: Duration,
    ) -> QueueResult<bool>;

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Jobs in one status, oldest first, at most `limit`
    async fn list(&self, queue: &str, status: JobStatus, limit: usize) -> QueueResult<Vec<JobRecord>>;

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts>;

    /// Delete `completed` or `failed` jobs that finished strictly before `cutoff`
    async fn clean(
        &self,
        queue: &str,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>>;

    /// Active jobs whose lock expired before `now`
    async fn expired_locks(&self, queue: &str, now: DateTime<Utc>) -> QueueResult<Vec<JobRecord>>;

    /// Close the connection; later calls fail with `BrokerUnavailable`
    async fn close(&self) -> QueueResult<()>;
}
