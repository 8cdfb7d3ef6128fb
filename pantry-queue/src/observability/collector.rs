use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    queue::Queue,
    observability::QueueMetricsSnapshot,
    worker::TaskHandle,
};

/// Samples per-queue job counts from the broker on a fixed interval.
///
/// Snapshots may be up to one interval stale; the broker stays the source of truth.
pub struct MetricsCollector {
    queues: Vec<Arc<Queue>>,
    latest: RwLock<HashMap<String, QueueMetricsSnapshot>>,
    task: Mutex<Option<TaskHandle>>,
}

impl MetricsCollector {
    pub fn new(queues: Vec<Arc<Queue>>) -> Self {
        Self {
            queues,
            latest: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    /// Spawn the sampling task. Calling it again replaces nothing: the first task keeps running.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let collector = Arc::clone(self);

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => collector.tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("metrics collector stopped");
        });

        info!(interval_ms = period.as_millis() as u64, "started metrics collector");
        *task = Some(TaskHandle::new(shutdown_tx, join_handle));
    }

    /// Sample every queue once. A queue whose counts cannot be read keeps its previous snapshot.
    pub async fn tick(&self) {
        for queue in &self.queues {
            match queue.counts().await {
                Ok(counts) => {
                    let snapshot = QueueMetricsSnapshot {
                        queue: queue.name().to_string(),
                        counts,
                        counters: queue.counters().snapshot(),
                        sampled_at: Utc::now(),
                    };
                    info!(
                        queue = %snapshot.queue,
                        waiting = counts.waiting,
                        delayed = counts.delayed,
                        active = counts.active,
                        completed = counts.completed,
                        failed = counts.failed,
                        "queue metrics"
                    );
                    self.latest.write().insert(snapshot.queue.clone(), snapshot);
                }
                Err(e) => warn!(queue = %queue.name(), "failed to sample queue counts: {}", e),
            }
        }
    }

    pub fn snapshot(&self, queue: &str) -> Option<QueueMetricsSnapshot> {
        self.latest.read().get(queue).cloned()
    }

    /// Latest snapshot of every sampled queue, ordered by queue name
    pub fn snapshots(&self) -> Vec<QueueMetricsSnapshot> {
        let mut all: Vec<_> = self.latest.read().values().cloned().collect();
        all.sort_by(|a, b| a.queue.cmp(&b.queue));
        all
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop the sampling task if it is running
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobOptions, JobEvent, broker::MemoryBroker, config::QueueConfig, types::WorkerId};
    use serde_json::json;
    use tokio::sync::broadcast;

    fn analytics(broker: &MemoryBroker) -> Arc<Queue> {
        let (events, _) = broadcast::channel::<JobEvent>(16);
        Arc::new(Queue::new(
            QueueConfig::new("analytics"),
            Arc::new(broker.clone()),
            events,
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn tick_records_counts_and_counters() {
        let broker = MemoryBroker::new();
        let queue = analytics(&broker);
        queue.enqueue("track_view", json!({"recipe": 1}), JobOptions::new()).await.unwrap();
        queue.enqueue("track_view", json!({"recipe": 2}), JobOptions::new()).await.unwrap();
        queue.dequeue_next(&WorkerId::new("analytics")).await.unwrap();

        let collector = MetricsCollector::new(vec![queue]);
        assert!(collector.snapshot("analytics").is_none());

        collector.tick().await;
        let snapshot = collector.snapshot("analytics").unwrap();
        assert_eq!(snapshot.counts.waiting, 1);
        assert_eq!(snapshot.counts.active, 1);
        assert_eq!(snapshot.counters.enqueued, 2);
        assert_eq!(snapshot.counters.processing, 1);
    }

    #[tokio::test]
    async fn broker_outage_keeps_previous_snapshot() {
        let broker = MemoryBroker::new();
        let queue = analytics(&broker);
        queue.enqueue("track_view", json!({}), JobOptions::new()).await.unwrap();

        let collector = MetricsCollector::new(vec![queue]);
        collector.tick().await;
        let before = collector.snapshot("analytics").unwrap();

        broker.disconnect();
        collector.tick().await;
        assert_eq!(collector.snapshot("analytics").unwrap(), before);
    }

    #[tokio::test]
    async fn background_task_samples_until_stopped() {
        let broker = MemoryBroker::new();
        let collector = Arc::new(MetricsCollector::new(vec![analytics(&broker)]));

        collector.start(Duration::from_millis(10));
        assert!(collector.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collector.snapshots().len(), 1);

        collector.stop().await;
        assert!(!collector.is_running());
    }
}
