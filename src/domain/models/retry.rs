//! Retry bookkeeping for reconciler actions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How retry delays grow between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry on the next trigger with no delay.
    Immediate,
    /// Fixed delay between attempts.
    Fixed { delay_ms: u64 },
    /// Exponential backoff doubling from `initial_ms` up to `max_ms`.
    ExponentialBackoff { initial_ms: u64, max_ms: u64 },
}

/// Per-task retry state, stored in the root holder's tag map keyed by the
/// original task id rather than on the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retryer {
    pub attempts: u32,
    pub policy: RetryPolicy,
}

impl Retryer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts: 0,
            policy,
        }
    }

    pub fn immediate() -> Self {
        Self::new(RetryPolicy::Immediate)
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self::new(RetryPolicy::ExponentialBackoff {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        })
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        match &self.policy {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryPolicy::ExponentialBackoff { initial_ms, max_ms } => {
                let factor = 2u64.saturating_pow(self.attempts.min(16));
                Duration::from_millis(initial_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }

    /// Record one more failed attempt.
    pub fn record_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            policy: self.policy.clone(),
        }
    }
}
