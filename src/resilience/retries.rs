//! Retry logic.
//!
//! # Responsibilities
//! - Bound the number of attempts per request
//! - Enforce a retry budget so retries stay a fraction of total traffic
//!
//! # Design Decisions
//! - Every retry goes to a different backend (the dispatcher excludes failures)
//! - Jittered backoff prevents thundering herd
//! - The budget floor lets a quiet service still retry

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::DispatchConfig;
use crate::resilience::backoff::backoff_delay;

/// Attempt limits and pacing for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Wait before attempt number `attempt` (the first attempt never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        backoff_delay(attempt.saturating_sub(1), self.base_delay, self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Caps retries at `min_retries + ratio * requests` over the process lifetime.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f64,
    min_retries: u64,
    requests: AtomicU64,
    retries: AtomicU64,
}

impl RetryBudget {
    pub fn new(ratio: f64, min_retries: u64) -> Self {
        Self {
            ratio: ratio.max(0.0),
            min_retries,
            requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Spend one retry if the budget allows it.
    pub fn try_spend(&self) -> bool {
        let allowed = self.min_retries + (self.requests.load(Ordering::Relaxed) as f64 * self.ratio) as u64;
        self.retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |spent| {
                (spent < allowed).then_some(spent + 1)
            })
            .is_ok()
    }

    pub fn retries_spent(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_has_a_floor_and_grows_with_traffic() {
        let budget = RetryBudget::new(0.5, 2);
        assert!(budget.try_spend());
        assert!(budget.try_spend());
        assert!(!budget.try_spend());

        for _ in 0..4 {
            budget.record_request();
        }
        assert!(budget.try_spend());
        assert!(budget.try_spend());
        assert!(!budget.try_spend());
        assert_eq!(budget.retries_spent(), 4);
    }

    #[test]
    fn first_attempt_never_waits() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert!(policy.delay_before(2) >= Duration::from_millis(50));
    }
}
