pub mod router;

pub use router::{JobRouter, JobHandler};

use crate::{JobError, JobOptions, JobPriority};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

/// A typed job: its payload is the serialized value of the implementing type.
///
/// Enqueue with [`QueueRegistry::add`](crate::QueueRegistry::add) and dispatch
/// by `JOB_TYPE` through a [`JobRouter`].
#[async_trait]
pub trait Job: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Shared state handed to every execution (clients, pools, settings)
    type Context: Send + Sync + Clone + 'static;

    /// Job type identifier for dispatch
    const JOB_TYPE: &'static str;

    /// Queue the job is enqueued on
    const QUEUE: &'static str;

    const PRIORITY: JobPriority = JobPriority::Normal;

    /// Execute the job with the given context
    async fn execute(&self, ctx: Self::Context) -> Result<(), JobError>;

    /// Enqueue options for this instance (default: `PRIORITY`, queue defaults otherwise)
    fn options(&self) -> JobOptions {
        JobOptions::new().with_priority(Self::PRIORITY)
    }
}
