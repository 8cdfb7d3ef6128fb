//! Administrative operations on a [`QueueRegistry`]: pause/resume, cleanup
//! of terminal jobs and coordinated shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::{QueueResult, JobId, JobStatus, registry::QueueRegistry};

impl QueueRegistry {
    /// Stop dequeuing from `queue`; jobs already active run to completion
    #[instrument(skip(self))]
    pub fn pause_queue(&self, queue: &str) -> QueueResult<()> {
        self.queue(queue)?.pause();
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn resume_queue(&self, queue: &str) -> QueueResult<()> {
        self.queue(queue)?.resume();
        Ok(())
    }

    pub fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        Ok(self.queue(queue)?.is_paused())
    }

    /// Delete completed jobs that finished more than `max_age` ago
    #[instrument(skip(self))]
    pub async fn clean_completed_jobs(&self, queue: &str, max_age: Duration) -> QueueResult<Vec<JobId>> {
        self.clean(queue, JobStatus::Completed, max_age).await
    }

    /// Delete failed jobs that failed more than `max_age` ago
    #[instrument(skip(self))]
    pub async fn clean_failed_jobs(&self, queue: &str, max_age: Duration) -> QueueResult<Vec<JobId>> {
        self.clean(queue, JobStatus::Failed, max_age).await
    }

    async fn clean(&self, queue: &str, status: JobStatus, max_age: Duration) -> QueueResult<Vec<JobId>> {
        let removed = self.queue(queue)?.clean(status, max_age).await?;
        info!(queue, %status, removed = removed.len(), "cleaned jobs");
        Ok(removed)
    }

    /// Close every queue, wait for in-flight jobs, stop background tasks and
    /// close the broker connection. Later calls return immediately.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.shutdown_inner(None).await
    }

    /// Like [`shutdown`](Self::shutdown), abandoning jobs still running after
    /// `grace`. Abandoned jobs stay `active` until their lock expires.
    pub async fn shutdown_with_grace(&self, grace: Duration) -> QueueResult<()> {
        self.shutdown_inner(Some(grace)).await
    }

    async fn shutdown_inner(&self, grace: Option<Duration>) -> QueueResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down queue registry");

        for entry in self.queues.values() {
            entry.queue.close();
        }

        let mut stopping = Vec::new();
        for entry in self.queues.values() {
            if let Some(pool) = entry.pool.lock().await.take() {
                stopping.push(async move {
                    match grace {
                        Some(grace) => pool.shutdown_within(grace).await,
                        None => pool.shutdown().await,
                    }
                });
            }
        }
        futures::future::join_all(stopping).await;

        self.collector.stop().await;
        self.stalled.stop().await;

        if let Err(e) = self.broker.close().await {
            warn!("error closing broker connection: {}", e);
            return Err(e);
        }

        info!("queue registry shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        JobOptions, JobStatus, QueueError, QueueRegistry,
        config::{QueueConfig, RegistryConfig},
    };
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> QueueRegistry {
        QueueRegistry::in_memory(
            RegistryConfig::new()
                .with_queue(QueueConfig::new("analytics"))
                .with_metrics_interval(None)
                .with_stalled_interval(None)
                .with_poll_interval(Duration::from_millis(20)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn pause_unknown_queue_fails() {
        let registry = registry();
        assert_eq!(
            registry.pause_queue("media").unwrap_err(),
            QueueError::QueueNotFound("media".to_string())
        );
    }

    #[tokio::test]
    async fn clean_only_touches_target_status() {
        let registry = registry();
        registry.process_queue_fn("analytics", |_| async { Ok(()) }).await.unwrap();
        let done = registry.add_job("analytics", "track_view", json!({}), JobOptions::new()).await.unwrap();

        for _ in 0..100 {
            if registry.get_queue_status("analytics").await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        registry.pause_queue("analytics").unwrap();
        let waiting = registry.add_job("analytics", "track_view", json!({}), JobOptions::new()).await.unwrap();

        assert!(registry.clean_failed_jobs("analytics", Duration::ZERO).await.unwrap().is_empty());
        assert!(registry.clean_completed_jobs("analytics", Duration::from_secs(3600)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = registry.clean_completed_jobs("analytics", Duration::ZERO).await.unwrap();
        assert_eq!(removed, vec![done.id.clone()]);

        assert!(matches!(registry.get_job("analytics", &done.id).await, Err(QueueError::JobNotFound(_))));
        assert_eq!(registry.get_job("analytics", &waiting.id).await.unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_queues() {
        let registry = registry();
        registry.process_queue_fn("analytics", |_| async { Ok(()) }).await.unwrap();

        registry.shutdown().await.unwrap();
        registry.shutdown().await.unwrap();
        assert!(registry.is_shut_down());

        let rejected = registry.add_job("analytics", "track_view", json!({}), JobOptions::new()).await;
        assert_eq!(rejected.unwrap_err(), QueueError::QueueClosed("analytics".to_string()));
        assert!(matches!(
            registry.process_queue_fn("analytics", |_| async { Ok(()) }).await,
            Err(QueueError::QueueClosed(_))
        ));
    }
}
