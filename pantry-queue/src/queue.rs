use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    QueueResult, QueueError, JobError, JobId, JobRecord, JobStatus, JobCounts, JobOptions, JobEvent,
    broker::{Broker, Settlement},
    config::QueueConfig,
    observability::QueueCounters,
    types::{WorkerId, record::earlier_by},
};

/// One named queue: job lifecycle operations on top of the shared broker
pub struct Queue {
    config: QueueConfig,
    broker: Arc<dyn Broker>,
    counters: QueueCounters,
    events: broadcast::Sender<JobEvent>,
    lock_duration: Duration,
    closed: AtomicBool,
    /// Checked by workers before every claim
    paused: watch::Sender<bool>,
    /// Wakes idle workers when new work arrives
    work_available: Notify,
}

impl Queue {
    pub fn new(
        config: QueueConfig,
        broker: Arc<dyn Broker>,
        events: broadcast::Sender<JobEvent>,
        lock_duration: Duration,
    ) -> Self {
        Self {
            config,
            broker,
            counters: QueueCounters::new(),
            events,
            lock_duration,
            closed: AtomicBool::new(false),
            paused: watch::Sender::new(false),
            work_available: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Persist a new job in `waiting`, or `delayed` when a delay is set.
    ///
    /// A `job_id` that already exists returns the stored job untouched.
    /// Broker failures are returned to the caller; nothing is buffered.
    #[instrument(skip(self, payload, options), fields(queue = %self.config.name))]
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobRecord> {
        if self.is_closed() {
            return Err(QueueError::QueueClosed(self.config.name.clone()));
        }

        let custom_id = options.job_id.clone();
        let job_id = match &custom_id {
            Some(id) => id.clone(),
            None => self.broker.next_id().await?,
        };
        let max_attempts = options.attempts.unwrap_or(self.config.default_attempts).max(1);
        let backoff = options.backoff.unwrap_or(self.config.default_backoff);

        let mut record = JobRecord::new(
            job_id,
            self.config.name.clone(),
            job_type,
            payload,
            &options,
            max_attempts,
            backoff,
        );

        let stored = loop {
            let (stored, created) = self.broker.add(record.clone()).await?;
            if created {
                break stored;
            }
            if custom_id.is_some() {
                debug!(job_id = %stored.id, "job id already present, returning existing job");
                return Ok(stored);
            }
            // A caller-chosen id took this counter value; draw the next one
            debug!(job_id = %stored.id, "generated id already taken, drawing another");
            record.id = self.broker.next_id().await?;
        };

        self.counters.increment_enqueued();
        self.emit(JobEvent::Enqueued {
            job_id: stored.id.clone(),
            queue: self.config.name.clone(),
            job_type: stored.job_type.clone(),
            at: stored.created_at,
        });
        self.work_available.notify_one();

        info!(job_id = %stored.id, job_type, status = %stored.status, "enqueued job");
        Ok(stored)
    }

    /// Claim the next eligible job for `worker` and mark it `active`
    pub async fn dequeue_next(&self, worker: &WorkerId) -> QueueResult<Option<JobRecord>> {
        let claimed = self.broker.claim(&self.config.name, worker, self.lock_duration).await?;

        if let Some(job) = &claimed {
            self.counters.increment_processing();
            self.emit(JobEvent::Active {
                job_id: job.id.clone(),
                queue: self.config.name.clone(),
                at: job.processed_at.unwrap_or_else(Utc::now),
            });
        }

        Ok(claimed)
    }

    /// Mark an active job completed. Acking a job that is no longer active is a no-op.
    pub async fn ack(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let settled = self
            .broker
            .settle(&self.config.name, job_id, Settlement::Completed)
            .await?;

        match &settled {
            Some(job) => {
                self.counters.increment_completed();
                self.emit(JobEvent::Completed {
                    job_id: job.id.clone(),
                    queue: self.config.name.clone(),
                    at: job.completed_at.unwrap_or_else(Utc::now),
                });
                debug!(queue = %self.config.name, job_id = %job_id, "job completed");
            }
            None => debug!(queue = %self.config.name, job_id = %job_id, "ack ignored, job not active"),
        }

        Ok(settled)
    }

    /// Record a failed attempt: reschedule with backoff while attempts remain,
    /// otherwise fail permanently. A no-op if the job is no longer active.
    pub async fn fail(&self, job_id: &JobId, error: &JobError) -> QueueResult<Option<JobRecord>> {
        let settlement = Settlement::Failed {
            error: error.to_string(),
            retryable: error.is_retryable(),
            backoff_cap: self.config.max_backoff,
        };
        let settled = self.broker.settle(&self.config.name, job_id, settlement).await?;

        let Some(job) = &settled else {
            debug!(queue = %self.config.name, job_id = %job_id, "fail ignored, job not active");
            return Ok(None);
        };

        let now = Utc::now();
        match job.status {
            JobStatus::Delayed => {
                let retry_at = job.delay_until.unwrap_or(now);
                self.counters.increment_retried();
                self.emit(JobEvent::Retrying {
                    job_id: job.id.clone(),
                    queue: self.config.name.clone(),
                    retry_at,
                    error: error.to_string(),
                    at: now,
                });
                warn!(
                    queue = %self.config.name,
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    %retry_at,
                    "job failed, will retry: {}", error
                );
            }
            _ => {
                self.counters.increment_failed();
                self.emit(JobEvent::Failed {
                    job_id: job.id.clone(),
                    queue: self.config.name.clone(),
                    error: error.to_string(),
                    at: job.failed_at.unwrap_or(now),
                });
                error!(
                    queue = %self.config.name,
                    job_id = %job.id,
                    attempts = job.attempts,
                    "job failed permanently: {}", error
                );
            }
        }

        Ok(settled)
    }

    /// Renew the lock held by `worker` on an active job
    pub async fn extend_lock(&self, job_id: &JobId, worker: &WorkerId) -> QueueResult<bool> {
        self.broker
            .extend_lock(&self.config.name, job_id, worker, self.lock_duration)
            .await
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        self.broker
            .get(&self.config.name, job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    pub async fn jobs(&self, status: JobStatus, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.broker.list(&self.config.name, status, limit).await
    }

    pub async fn counts(&self) -> QueueResult<JobCounts> {
        self.broker.counts(&self.config.name).await
    }

    /// Delete `completed` or `failed` jobs older than `max_age`
    pub async fn clean(&self, status: JobStatus, max_age: Duration) -> QueueResult<Vec<JobId>> {
        let cutoff = earlier_by(Utc::now(), max_age);
        let removed = self.broker.clean(&self.config.name, status, cutoff).await?;

        let now = Utc::now();
        for job_id in &removed {
            self.emit(JobEvent::Removed {
                job_id: job_id.clone(),
                queue: self.config.name.clone(),
                at: now,
            });
        }
        Ok(removed)
    }

    /// Stop claiming new jobs; active jobs keep running
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!(queue = %self.config.name, "queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!(queue = %self.config.name, "queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub(crate) fn paused_watch(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Stop accepting new jobs
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.config.name, "queue closed");
        }
        self.work_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once new work is enqueued or `timeout` elapses
    pub(crate) async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.work_available.notified()).await;
    }

    pub(crate) fn wake_workers(&self) {
        self.work_available.notify_waiters();
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
