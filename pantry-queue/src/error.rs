use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("No processor registered for queue: {0}")]
    ProcessorMissing(String),

    #[error("Queue is closed: {0}")]
    QueueClosed(String),

    /// Connection-level failure; callers may retry the operation later
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Broker command failed: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether the error is a transient broker connectivity problem
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_))
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("{0}")]
    Retryable(String),

    /// Permanent error - fail immediately, no retry
    #[error("{0}")]
    Permanent(String),

    /// Processor did not finish within the job's timeout
    #[error("job timed out after {0}ms")]
    Timeout(u64),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid payload: {}", err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Self::BrokerUnavailable(err.to_string())
        } else {
            Self::Broker(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable() {
        assert!(JobError::Timeout(500).is_retryable());
        assert!(JobError::retryable("smtp 451").is_retryable());
        assert!(!JobError::permanent("bad address").is_retryable());
        assert_eq!(JobError::Timeout(500).to_string(), "job timed out after 500ms");
    }

    #[test]
    fn only_connectivity_is_transient() {
        assert!(QueueError::BrokerUnavailable("reset".into()).is_transient());
        assert!(!QueueError::QueueNotFound("media".into()).is_transient());
    }
}
