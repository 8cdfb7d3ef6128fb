//! # pantry-queue: background job core
//!
//! Named queues on a shared broker, each serviced by a bounded worker pool.
//!
//! - **Atomic claims**: a job is handed to at most one worker at a time
//! - **Retries with backoff**: `fixed` or `exponential`, optionally capped
//! - **Priorities and delays**: higher priority first, FIFO within a priority
//! - **Pause/resume, cleanup, shutdown** through the registry
//! - **Observability**: `tracing` spans, per-queue counters, sampled counts,
//!   lifecycle event stream and an optional Prometheus exporter
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pantry_queue::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> QueueResult<()> {
//! let registry = QueueRegistry::in_memory(RegistryConfig::recipe_defaults())?;
//!
//! registry
//!     .process_queue_fn("email", |job| async move {
//!         tracing::info!(job_type = %job.job_type, "sending email");
//!         Ok(())
//!     })
//!     .await?;
//!
//! registry
//!     .add_job("email", "send_email", json!({"to": "cook@example.com"}), JobOptions::new())
//!     .await?;
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod observability;
pub mod queue;
pub mod registry;
pub mod types;
pub mod worker;

pub use backoff::{BackoffKind, BackoffPolicy};
pub use broker::{Broker, MemoryBroker, Settlement};
pub use config::{BrokerConfig, QueueConfig, RegistryConfig};
pub use error::{QueueError, QueueResult, JobError};
pub use job::{Job, JobRouter};
pub use observability::{CounterSnapshot, MetricsCollector, QueueCounters, QueueMetricsSnapshot, StalledMonitor};
pub use queue::Queue;
pub use registry::QueueRegistry;
pub use types::{
    JobId, WorkerId, JobPriority, JobOptions, JobCounts, JobRecord, JobStatus, JobEvent
};
pub use worker::{Processor, WorkerPool, processor_fn};

#[cfg(feature = "redis")]
pub use broker::RedisBroker;

#[cfg(feature = "metrics")]
pub use observability::PrometheusExporter;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to configure queues, enqueue jobs and register processors
pub mod prelude {
    pub use crate::{
        QueueRegistry, RegistryConfig, QueueConfig, BrokerConfig, Broker, MemoryBroker
    };

    pub use crate::{
        JobId, JobOptions, JobPriority, JobRecord, JobStatus, JobCounts, JobEvent,
        BackoffPolicy, BackoffKind
    };

    pub use crate::{QueueError, QueueResult, JobError};

    pub use crate::{Job, JobRouter, Processor, processor_fn};

    pub use async_trait::async_trait;
}
