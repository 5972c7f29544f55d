use std::time::Duration;

use dailypoll_core::config::{
    DEFAULT_RETRY_BASE_SECS, DEFAULT_RETRY_CAP_SECS, SchedulerConfig,
};

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Re-arm the job; it becomes eligible again after this delay.
    Retry(Duration),
    /// Attempts exhausted — mark the job terminally failed.
    GiveUp,
}

/// Exponential backoff policy: `base * 2^(attempts-1)`, capped.
///
/// Pure and stateless — a function of the attempt count only, so it can be
/// tested without a store or a clock.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_base_secs),
            Duration::from_secs(config.retry_cap_secs),
        )
    }

    /// Decide the fate of a job whose attempt number `attempts` (counted
    /// from 1) just failed.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> Decision {
        if attempts >= max_attempts {
            return Decision::GiveUp;
        }
        // 2^exp saturates well before overflow matters for any sane cap.
        let exp = attempts.saturating_sub(1).min(31);
        let delay = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.cap);
        Decision::Retry(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_RETRY_BASE_SECS),
            Duration::from_secs(DEFAULT_RETRY_CAP_SECS),
        )
    }
}
