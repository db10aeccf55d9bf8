//! Port Conflict Recovery Policy
//!
//! Bounds the kill-and-retry cycle triggered by "address already in use",
//! with exponential growth of the grace period between attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Maximum consecutive recovery attempts before giving up
    pub max_attempts: u32,

    /// Grace multiplier applied for each further attempt
    pub backoff_multiplier: f64,

    /// Upper bound for the grace period in milliseconds
    pub max_grace_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_multiplier: 2.0,
            max_grace_ms: 8000,
        }
    }
}

impl RecoveryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Whether 1-based `attempt` may still run
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Grace to wait after killing the occupant, before retry `attempt`
    ///
    /// The first attempt waits exactly `base`.
    pub fn grace_for(&self, attempt: u32, base: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let grace_ms = (base.as_millis() as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_grace_ms as f64);

        Duration::from_millis(grace_ms as u64)
    }
}
