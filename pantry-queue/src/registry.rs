use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, instrument, warn};

use crate::{
    QueueResult, QueueError, Job, JobError, JobId, JobRecord, JobStatus, JobCounts, JobOptions, JobEvent,
    broker::{Broker, MemoryBroker},
    config::RegistryConfig,
    observability::{MetricsCollector, QueueMetricsSnapshot, StalledMonitor},
    queue::Queue,
    worker::{processor_fn, Processor, WorkerPool},
};

const EVENT_CAPACITY: usize = 1024;

pub(crate) struct QueueEntry {
    pub(crate) queue: Arc<Queue>,
    pub(crate) pool: Mutex<Option<WorkerPool>>,
}

/// Owns every configured queue, its worker pool and the background tasks.
///
/// Built once at startup and passed to whatever needs to enqueue or process
/// jobs. Construction spawns tasks, so it must happen inside a Tokio runtime.
pub struct QueueRegistry {
    pub(crate) config: RegistryConfig,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) queues: HashMap<String, QueueEntry>,
    events: broadcast::Sender<JobEvent>,
    pub(crate) collector: Arc<MetricsCollector>,
    pub(crate) stalled: Arc<StalledMonitor>,
    pub(crate) shut_down: AtomicBool,
}

impl QueueRegistry {
    pub fn new(config: RegistryConfig, broker: Arc<dyn Broker>) -> QueueResult<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queues: HashMap<_, _> = config
            .queues
            .iter()
            .map(|queue_config| {
                let queue = Arc::new(Queue::new(
                    queue_config.clone(),
                    broker.clone(),
                    events.clone(),
                    config.lock_duration,
                ));
                let entry = QueueEntry {
                    queue,
                    pool: Mutex::new(None),
                };
                (queue_config.name.clone(), entry)
            })
            .collect();

        let all: Vec<_> = queues.values().map(|entry| entry.queue.clone()).collect();
        let collector = Arc::new(MetricsCollector::new(all.clone()));
        let stalled = Arc::new(StalledMonitor::new(all));

        if let Some(period) = config.metrics_interval {
            collector.start(period);
        }
        if let Some(period) = config.stalled_interval {
            stalled.start(period);
        }

        info!(queues = queues.len(), "queue registry initialized");

        Ok(Self {
            config,
            broker,
            queues,
            events,
            collector,
            stalled,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Registry backed by a fresh [`MemoryBroker`]
    pub fn in_memory(config: RegistryConfig) -> QueueResult<Self> {
        Self::new(config, Arc::new(MemoryBroker::new()))
    }

    /// Registry backed by Redis, with keys namespaced by `config.key_prefix`
    #[cfg(feature = "redis")]
    pub async fn redis(config: RegistryConfig, broker: &crate::BrokerConfig) -> QueueResult<Self> {
        let redis = crate::broker::RedisBroker::connect(broker, config.key_prefix.clone()).await?;
        Self::new(config, Arc::new(redis))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn queue(&self, name: &str) -> QueueResult<&Arc<Queue>> {
        self.entry(name).map(|entry| &entry.queue)
    }

    pub(crate) fn entry(&self, name: &str) -> QueueResult<&QueueEntry> {
        self.queues
            .get(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    /// Configured queue names, sorted
    pub fn queue_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Enqueue a job on `queue`
    #[instrument(skip(self, data, options))]
    pub async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        data: Value,
        options: JobOptions,
    ) -> QueueResult<JobRecord> {
        self.queue(queue)?.enqueue(job_type, data, options).await
    }

    /// Enqueue a typed job on `J::QUEUE` with the job's own options
    pub async fn add<J: Job>(&self, job: &J) -> QueueResult<JobRecord> {
        let payload = serde_json::to_value(job)?;
        self.add_job(J::QUEUE, J::JOB_TYPE, payload, job.options()).await
    }

    /// Register the processor for `queue` and start its worker pool.
    ///
    /// Registering again replaces the processor: the previous pool finishes
    /// its in-flight jobs before the new one starts claiming.
    #[instrument(skip(self, processor))]
    pub async fn process_queue(&self, queue: &str, processor: Arc<dyn Processor>) -> QueueResult<()> {
        let entry = self.entry(queue)?;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::QueueClosed(queue.to_string()));
        }

        let mut pool = entry.pool.lock().await;
        // shutdown may have drained the slot while we waited for it
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::QueueClosed(queue.to_string()));
        }
        if let Some(previous) = pool.take() {
            warn!(queue, "replacing registered processor");
            previous.shutdown().await;
        }

        *pool = Some(WorkerPool::start(
            entry.queue.clone(),
            processor,
            self.config.poll_interval,
        ));
        Ok(())
    }

    /// [`process_queue`](Self::process_queue) with an async closure
    pub async fn process_queue_fn<F, Fut>(&self, queue: &str, f: F) -> QueueResult<()>
    where
        F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.process_queue(queue, processor_fn(f)).await
    }

    pub async fn has_processor(&self, queue: &str) -> QueueResult<bool> {
        Ok(self.entry(queue)?.pool.lock().await.is_some())
    }

    /// Fail with `ProcessorMissing` for the first queue without a processor
    pub async fn require_processors(&self) -> QueueResult<()> {
        for name in self.queue_names() {
            if !self.has_processor(name).await? {
                return Err(QueueError::ProcessorMissing(name.to_string()));
            }
        }
        Ok(())
    }

    /// Current job counts of `queue`, read from the broker
    pub async fn get_queue_status(&self, queue: &str) -> QueueResult<JobCounts> {
        self.queue(queue)?.counts().await
    }

    pub async fn get_job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.queue(queue)?.get_job(job_id).await
    }

    pub async fn jobs(&self, queue: &str, status: JobStatus, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.queue(queue)?.jobs(status, limit).await
    }

    /// Lifecycle events of every queue. Slow consumers observe `Lagged` items.
    pub fn events(&self) -> BroadcastStream<JobEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Last sampled snapshot of `queue`, if the collector has run
    pub fn metrics(&self, queue: &str) -> QueueResult<Option<QueueMetricsSnapshot>> {
        self.entry(queue)?;
        Ok(self.collector.snapshot(queue))
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn stalled_monitor(&self) -> &Arc<StalledMonitor> {
        &self.stalled
    }
}
