use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Job lifecycle events broadcast for observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        queue: String,
        job_type: String,
        at: DateTime<Utc>,
    },

    /// Claimed by a worker
    Active {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    Retrying {
        job_id: JobId,
        queue: String,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    Completed {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    /// Failed permanently
    Failed {
        job_id: JobId,
        queue: String,
        error: String,
        at: DateTime<Utc>,
    },

    /// Active job whose lock lapsed without ack or fail
    Stalled {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    /// Terminal record deleted by cleanup
    Removed {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Active { .. } => "active",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
            Self::Removed { .. } => "removed",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. }
            | Self::Removed { job_id, .. } => job_id,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Self::Enqueued { queue, .. }
            | Self::Active { queue, .. }
            | Self::Retrying { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Failed { queue, .. }
            | Self::Stalled { queue, .. }
            | Self::Removed { queue, .. } => queue,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Active { at, .. }
            | Self::Retrying { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. }
            | Self::Stalled { at, .. }
            | Self::Removed { at, .. } => at,
        }
    }
}
