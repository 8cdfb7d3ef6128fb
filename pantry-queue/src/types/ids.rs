use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job
///
/// Broker-assigned ids are the decimal rendering of a monotonic counter;
/// callers may supply their own id for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Build the id for a broker counter value
    pub fn from_sequence(seq: u64) -> Self {
        Self(seq.to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identity of one worker task, recorded on the jobs it claims
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Generate a new worker id scoped to a queue
    pub fn new(queue: &str) -> Self {
        Self(format!("{}:{}", queue, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ids_render_as_decimal() {
        assert_eq!(JobId::from_sequence(42).as_str(), "42");
    }

    #[test]
    fn worker_ids_are_unique_per_queue() {
        let a = WorkerId::new("media");
        let b = WorkerId::new("media");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("media:"));
    }
}
