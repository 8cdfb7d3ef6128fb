use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    JobError, JobRecord,
    queue::Queue,
    types::WorkerId,
    worker::Processor,
};

/// Bounded set of workers servicing one queue.
///
/// Each of the `concurrency` tasks loops claim -> execute -> ack/fail, so the
/// number of active jobs from this pool never exceeds `concurrency`.
pub struct WorkerPool {
    queue: Arc<Queue>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers for `queue`. Must be called inside a Tokio runtime.
    pub fn start(queue: Arc<Queue>, processor: Arc<dyn Processor>, poll_interval: Duration) -> Self {
        let concurrency = queue.config().concurrency.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let workers = (0..concurrency)
            .map(|_| {
                let worker = Worker {
                    id: WorkerId::new(queue.name()),
                    queue: queue.clone(),
                    processor: processor.clone(),
                    poll_interval,
                    shutdown_rx: shutdown_tx.subscribe(),
                    paused_rx: queue.paused_watch(),
                    in_flight: in_flight.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(queue = %queue.name(), concurrency, "started worker pool");

        Self {
            queue,
            shutdown_tx,
            workers,
            in_flight,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Jobs currently executing in this pool
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop claiming and wait for in-flight jobs to finish
    pub async fn shutdown(self) {
        self.shutdown_inner(None).await
    }

    /// Stop claiming and wait up to `grace` for in-flight jobs; the rest are
    /// abandoned in `active` and later reported as stalled.
    pub async fn shutdown_within(self, grace: Duration) {
        self.shutdown_inner(Some(grace)).await
    }

    async fn shutdown_inner(self, grace: Option<Duration>) {
        self.shutdown_tx.send_replace(true);
        self.queue.wake_workers();

        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        let joined = futures::future::join_all(self.workers);

        match grace {
            Some(grace) => {
                if tokio::time::timeout(grace, joined).await.is_err() {
                    warn!(
                        queue = %self.queue.name(),
                        abandoned = self.in_flight.load(Ordering::SeqCst),
                        "grace period elapsed, abandoning in-flight jobs"
                    );
                    for abort in aborts {
                        abort.abort();
                    }
                }
            }
            None => {
                joined.await;
            }
        }

        info!(queue = %self.queue.name(), "worker pool stopped");
    }
}

enum Wake {
    Continue,
    Stop,
}

struct Worker {
    id: WorkerId,
    queue: Arc<Queue>,
    processor: Arc<dyn Processor>,
    poll_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    paused_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = %self.id, "worker started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            if *self.paused_rx.borrow_and_update() {
                match self.wait_for_resume().await {
                    Wake::Continue => continue,
                    Wake::Stop => break,
                }
            }

            match self.queue.dequeue_next(&self.id).await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => {
                    if let Wake::Stop = self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue.name(), worker = %self.id, "error claiming job: {}", e);
                    if let Wake::Stop = self.backoff_after_error().await {
                        break;
                    }
                }
            }
        }

        debug!(worker = %self.id, "worker stopped");
    }

    async fn wait_for_resume(&mut self) -> Wake {
        tokio::select! {
            changed = self.paused_rx.changed() => match changed {
                Ok(()) => Wake::Continue,
                Err(_) => Wake::Stop,
            },
            _ = self.shutdown_rx.changed() => Wake::Stop,
        }
    }

    async fn idle(&mut self) -> Wake {
        tokio::select! {
            _ = self.queue.wait_for_work(self.poll_interval) => Wake::Continue,
            _ = self.paused_rx.changed() => Wake::Continue,
            _ = self.shutdown_rx.changed() => Wake::Stop,
        }
    }

    async fn backoff_after_error(&mut self) -> Wake {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => Wake::Continue,
            _ = self.shutdown_rx.changed() => Wake::Stop,
        }
    }

    /// Run the processor, renewing the job lock until it settles
    async fn execute(&self, job: JobRecord) {
        let span = info_span!(
            "job",
            queue = %job.queue,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
        );

        let job_id = job.id.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let finished = AssertUnwindSafe(self.execute_inner(job).instrument(span))
            .catch_unwind()
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // The worker outlives the job; an unsettled job is reported once its lock lapses
        if finished.is_err() {
            error!(queue = %self.queue.name(), worker = %self.id, job_id = %job_id, "panic while settling job");
        }
    }

    async fn execute_inner(&self, job: JobRecord) {
        let started = Instant::now();
        let job_id = job.id.clone();
        let timeout = job.timeout();

        let run = AssertUnwindSafe(self.processor.process(job)).catch_unwind();
        let run = async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => return Err(JobError::Timeout(limit.as_millis() as u64)),
                },
                None => run.await,
            };
            result.unwrap_or_else(|_| Err(JobError::retryable("processor panicked")))
        };
        tokio::pin!(run);

        let renew_every = (self.queue.lock_duration() / 2).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = heartbeat.tick() => {
                    match self.queue.extend_lock(&job_id, &self.id).await {
                        Ok(true) => {}
                        Ok(false) => warn!("lock no longer held by this worker"),
                        Err(e) => warn!("failed to renew job lock: {}", e),
                    }
                }
            }
        };

        let elapsed = started.elapsed();
        let settled = match &outcome {
            Ok(()) => {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "processor finished");
                self.queue.ack(&job_id).await
            }
            Err(e) => {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "processor failed: {}", e);
                self.queue.fail(&job_id, e).await
            }
        };

        if let Err(e) = settled {
            error!("failed to settle job: {}", e);
        }
    }
}
