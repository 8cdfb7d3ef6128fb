use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    QueueResult, QueueError, JobId, JobRecord, JobStatus, JobCounts,
    broker::{Broker, Settlement},
    types::{WorkerId, record::later_by},
};

/// Job ids and records of one queue, split by status
#[derive(Default)]
struct QueueLists {
    jobs: HashMap<JobId, JobRecord>,
    /// (priority rank, sequence) -> job
    waiting: BTreeMap<(u8, u64), JobId>,
    /// (eligible at, sequence) -> job
    delayed: BTreeMap<(DateTime<Utc>, u64), JobId>,
    active: HashSet<JobId>,
    completed: HashSet<JobId>,
    failed: HashSet<JobId>,
}

impl QueueLists {
    fn push_waiting(&mut self, job_id: JobId, rank: u8, seq: u64) {
        self.waiting.insert((rank, seq), job_id);
    }

    /// Move delayed jobs whose time has come into `waiting`
    fn promote_due(&mut self, now: DateTime<Utc>, seq: &mut u64) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let job_id = entry.remove();
            if let Some(record) = self.jobs.get_mut(&job_id) {
                record.status = JobStatus::Waiting;
                let rank = record.priority.rank();
                *seq += 1;
                self.push_waiting(job_id, rank, *seq);
            }
        }
    }

    fn ids_in(&self, status: JobStatus) -> Vec<JobId> {
        match status {
            JobStatus::Waiting => self.waiting.values().cloned().collect(),
            JobStatus::Delayed => self.delayed.values().cloned().collect(),
            JobStatus::Active => self.active.iter().cloned().collect(),
            JobStatus::Completed => self.completed.iter().cloned().collect(),
            JobStatus::Failed => self.failed.iter().cloned().collect(),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueLists>,
    id_counter: u64,
    seq: u64,
}

/// In-process broker; one mutex serializes every transition.
///
/// Suitable for tests, development and single-process deployments.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    connected: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate connection loss (test helper)
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Restore the connection after [`disconnect`](Self::disconnect)
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Force the lock of an active job to lapse (test helper)
    pub fn expire_lock(&self, queue: &str, job_id: &JobId) {
        let mut state = self.state.lock();
        if let Some(record) = state.queues.get_mut(queue).and_then(|q| q.jobs.get_mut(job_id)) {
            if record.status == JobStatus::Active {
                record.lock_until = Some(Utc::now() - chrono::Duration::seconds(1));
            }
        }
    }

    fn ensure_connected(&self) -> QueueResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::BrokerUnavailable("connection to memory broker is closed".to_string()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn next_id(&self) -> QueueResult<JobId> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        state.id_counter += 1;
        Ok(JobId::from_sequence(state.id_counter))
    }

    async fn add(&self, job: JobRecord) -> QueueResult<(JobRecord, bool)> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        let lists = state.queues.entry(job.queue.clone()).or_default();

        if let Some(existing) = lists.jobs.get(&job.id) {
            return Ok((existing.clone(), false));
        }

        match (job.status, job.delay_until) {
            (JobStatus::Delayed, Some(at)) => {
                lists.delayed.insert((at, seq), job.id.clone());
            }
            _ => lists.push_waiting(job.id.clone(), job.priority.rank(), seq),
        }
        lists.jobs.insert(job.id.clone(), job.clone());

        Ok((job, true))
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &WorkerId,
        lock_for: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        self.ensure_connected()?;
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(lists) = state.queues.get_mut(queue) else {
            return Ok(None);
        };

        lists.promote_due(now, &mut state.seq);

        let Some((_, job_id)) = lists.waiting.pop_first() else {
            return Ok(None);
        };
        let Some(record) = lists.jobs.get_mut(&job_id) else {
            return Err(QueueError::Internal(format!("waiting job {} has no record", job_id)));
        };

        record.activate(Some(worker.clone()), later_by(now, lock_for));
        lists.active.insert(job_id.clone());
        debug!(queue, job_id = %job_id, worker = %worker, "claimed job");

        Ok(Some(record.clone()))
    }

    async fn settle(
        &self,
        queue: &str,
        job_id: &JobId,
        settlement: Settlement,
    ) -> QueueResult<Option<JobRecord>> {
        self.ensure_connected()?;
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(lists) = state.queues.get_mut(queue) else {
            return Ok(None);
        };
        if !lists.active.remove(job_id) {
            return Ok(None);
        }
        let Some(record) = lists.jobs.get_mut(job_id) else {
            return Err(QueueError::Internal(format!("active job {} has no record", job_id)));
        };

        match settlement {
            Settlement::Completed => {
                record.complete();
                let settled = record.clone();
                if settled.remove_on_complete {
                    lists.jobs.remove(job_id);
                } else {
                    lists.completed.insert(job_id.clone());
                }
                Ok(Some(settled))
            }
            Settlement::Failed { error, retryable, backoff_cap } => {
                if retryable && record.can_retry() {
                    let delay = record.backoff.delay_for(record.attempts + 1, backoff_cap);
                    let retry_at = later_by(now, delay);
                    record.schedule_retry(error, retry_at);
                    state.seq += 1;
                    lists.delayed.insert((retry_at, state.seq), job_id.clone());
                    Ok(Some(record.clone()))
                } else {
                    record.fail(error);
                    let settled = record.clone();
                    if settled.remove_on_fail {
                        lists.jobs.remove(job_id);
                    } else {
                        lists.failed.insert(job_id.clone());
                    }
                    Ok(Some(settled))
                }
            }
        }
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        worker: &WorkerId,
        lock_for: Duration,
    ) -> QueueResult<bool> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let Some(record) = state.queues.get_mut(queue).and_then(|q| q.jobs.get_mut(job_id)) else {
            return Ok(false);
        };
        if record.status != JobStatus::Active || record.worker_id.as_ref() != Some(worker) {
            return Ok(false);
        }
        record.lock_until = Some(later_by(Utc::now(), lock_for));
        Ok(true)
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        Ok(state.queues.get(queue).and_then(|q| q.jobs.get(job_id)).cloned())
    }

    async fn list(&self, queue: &str, status: JobStatus, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        let Some(lists) = state.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut records: Vec<JobRecord> = lists
            .ids_in(status)
            .iter()
            .filter_map(|id| lists.jobs.get(id).cloned())
            .collect();

        // waiting and delayed already come out in claim order
        match status {
            JobStatus::Active => records.sort_by_key(|r| r.processed_at),
            JobStatus::Completed | JobStatus::Failed => records.sort_by_key(|r| r.finished_at()),
            _ => {}
        }
        records.truncate(limit);
        Ok(records)
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        self.ensure_connected()?;
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(lists) = state.queues.get_mut(queue) else {
            return Ok(JobCounts::default());
        };
        lists.promote_due(now, &mut state.seq);

        Ok(JobCounts {
            waiting: lists.waiting.len() as u64,
            delayed: lists.delayed.len() as u64,
            active: lists.active.len() as u64,
            completed: lists.completed.len() as u64,
            failed: lists.failed.len() as u64,
        })
    }

    async fn clean(
        &self,
        queue: &str,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>> {
        self.ensure_connected()?;
        if !status.is_terminal() {
            return Err(QueueError::InvalidConfig(format!("cannot clean {} jobs", status)));
        }

        let mut state = self.state.lock();
        let Some(lists) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let expired: Vec<JobId> = lists
            .ids_in(status)
            .into_iter()
            .filter(|id| {
                lists
                    .jobs
                    .get(id)
                    .and_then(JobRecord::finished_at)
                    .is_some_and(|finished| finished < cutoff)
            })
            .collect();

        for id in &expired {
            lists.jobs.remove(id);
            match status {
                JobStatus::Completed => lists.completed.remove(id),
                _ => lists.failed.remove(id),
            };
        }

        Ok(expired)
    }

    async fn expired_locks(&self, queue: &str, now: DateTime<Utc>) -> QueueResult<Vec<JobRecord>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        let Some(lists) = state.queues.get(queue) else {
            return Ok(Vec::new());
        };

        Ok(lists
            .active
            .iter()
            .filter_map(|id| lists.jobs.get(id))
            .filter(|record| record.lock_until.is_some_and(|until| until < now))
            .cloned()
            .collect())
    }

    async fn close(&self) -> QueueResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
