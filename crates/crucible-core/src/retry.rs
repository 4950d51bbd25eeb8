//! Bounded retry schedules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fixed backoff schedule with an attempt ceiling.
///
/// `delays_secs[n]` is the wait after failed attempt `n + 1`; attempts past
/// the end of the schedule reuse its last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays_secs: Vec<u64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays_secs: Vec<u64>) -> Self {
        Self { max_attempts, delays_secs }
    }

    /// Remote shell connections: 5, 15, 30, 60, 120 seconds between six attempts.
    pub fn remote_default() -> Self {
        Self::new(6, vec![5, 15, 30, 60, 120])
    }

    /// Instance termination: five attempts.
    pub fn termination_default() -> Self {
        Self::new(5, vec![5, 15, 30, 60])
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let secs = self
            .delays_secs
            .get(index)
            .or_else(|| self.delays_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if self.max_attempts > 1 && self.delays_secs.is_empty() {
            return Err("delays_secs must not be empty when retrying".to_string());
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::remote_default()
    }
}
