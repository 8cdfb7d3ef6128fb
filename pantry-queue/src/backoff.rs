//! Retry delay computation.
//!
//! Pure functions only: the queue asks for the delay before the next attempt
//! and schedules the job itself.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay for every retry
    Fixed,
    /// `delay * 2^(attempt - 1)`
    Exponential,
}

/// Backoff policy resolved onto each job at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay: u64,
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Fixed, delay: delay_ms }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Exponential, delay: delay_ms }
    }

    /// Delay before retry number `attempt`.
    ///
    /// `attempt` is 1 for the first retry (i.e. after the first failure);
    /// 0 is treated as 1. `cap`, when set, bounds the result.
    pub fn delay_for(&self, attempt: u32, cap: Option<Duration>) -> Duration {
        let attempt = attempt.max(1);
        let millis = match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.delay.saturating_mul(factor)
            }
        };

        let delay = Duration::from_millis(millis);
        match cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(1000)
    }
}
