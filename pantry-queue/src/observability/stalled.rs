use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{JobEvent, JobId, QueueResult, queue::Queue, worker::TaskHandle};

/// Reports active jobs whose lock expired because their worker stopped
/// renewing it. Stalled jobs are logged and counted, never requeued.
pub struct StalledMonitor {
    queues: Vec<Arc<Queue>>,
    /// Stalled jobs seen by the previous scan, so each is reported once
    reported: Mutex<HashSet<(String, JobId)>>,
    task: Mutex<Option<TaskHandle>>,
}

impl StalledMonitor {
    pub fn new(queues: Vec<Arc<Queue>>) -> Self {
        Self {
            queues,
            reported: Mutex::new(HashSet::new()),
            task: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>, period: Duration) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let monitor = Arc::clone(self);

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match monitor.check().await {
                            Ok(0) => debug!("no stalled jobs"),
                            Ok(found) => info!("found {} stalled jobs", found),
                            Err(e) => warn!("error during stalled job scan: {}", e),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        info!(interval_ms = period.as_millis() as u64, "started stalled job monitor");
        *task = Some(TaskHandle::new(shutdown_tx, join_handle));
    }

    /// Run one scan over every queue; returns the number of newly stalled jobs
    pub async fn check(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let mut current = HashSet::new();
        let mut newly_stalled = 0;
        let mut first_error = None;

        for queue in &self.queues {
            let expired = match queue.broker().expired_locks(queue.name(), now).await {
                Ok(expired) => expired,
                Err(e) => {
                    warn!(queue = %queue.name(), "failed to scan for stalled jobs: {}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            for job in expired {
                let key = (queue.name().to_string(), job.id.clone());
                if !self.reported.lock().contains(&key) {
                    warn!(
                        queue = %queue.name(),
                        job_id = %job.id,
                        job_type = %job.job_type,
                        worker = job.worker_id.as_ref().map(|w| w.as_str()).unwrap_or("unknown"),
                        "job stalled: lock expired without ack or fail"
                    );
                    queue.counters().increment_stalled();
                    queue.emit(JobEvent::Stalled {
                        job_id: job.id.clone(),
                        queue: queue.name().to_string(),
                        at: now,
                    });
                    newly_stalled += 1;
                }
                current.insert(key);
            }
        }

        *self.reported.lock() = current;

        match first_error {
            Some(e) if newly_stalled == 0 => Err(e),
            _ => Ok(newly_stalled),
        }
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }
}
