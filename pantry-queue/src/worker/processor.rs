use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use async_trait::async_trait;

use crate::{JobError, JobRecord};

/// Business logic invoked for every job claimed from a queue.
///
/// `Ok` acks the job; `Err` runs the retry state machine. Processors must be
/// idempotent: delivery is at-least-once.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: JobRecord) -> Result<(), JobError>;
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process(&self, job: JobRecord) -> Result<(), JobError> {
        (**self).process(job).await
    }
}

/// Adapts an async closure into a [`Processor`]
pub struct FnProcessor<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProcessor<F, Fut>
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f, _future: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F, Fut>
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn process(&self, job: JobRecord) -> Result<(), JobError> {
        (self.f)(job).await
    }
}

/// Box an async closure as a shareable processor
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(FnProcessor::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffPolicy, JobId, JobOptions};
    use serde_json::json;

    fn job(job_type: &str) -> JobRecord {
        JobRecord::new(
            JobId::from("1"),
            "notifications",
            job_type,
            json!({"user_id": 3}),
            &JobOptions::new(),
            3,
            BackoffPolicy::fixed(0),
        )
    }

    #[tokio::test]
    async fn closure_processor_runs() {
        let processor = processor_fn(|job: JobRecord| async move {
            match job.job_type.as_str() {
                "push_notification" => Ok(()),
                other => Err(JobError::permanent(format!("unknown type {}", other))),
            }
        });

        assert!(processor.process(job("push_notification")).await.is_ok());
        assert_eq!(
            processor.process(job("fax")).await,
            Err(JobError::permanent("unknown type fax"))
        );
    }
}
