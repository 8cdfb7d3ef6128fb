pub mod pool;
pub mod processor;

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

pub use pool::WorkerPool;
pub use processor::{Processor, FnProcessor, processor_fn};

/// Handle for an owned background task (sampler, stalled scan)
pub struct TaskHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(shutdown_tx: oneshot::Sender<()>, join_handle: JoinHandle<()>) -> Self {
        Self { shutdown_tx, join_handle }
    }

    /// Signal the task and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join_handle.await {
            warn!("background task join error: {}", e);
        }
    }

    /// Like [`shutdown`](Self::shutdown), aborting the task after `grace`
    pub async fn shutdown_within(self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        let abort = self.join_handle.abort_handle();
        if tokio::time::timeout(grace, self.join_handle).await.is_err() {
            abort.abort();
        }
    }
}
