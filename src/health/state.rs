//! Backend health state machine.
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! Counters reset on every transition and whenever the streak breaks, so a
//! single flaky probe never flips the state.

use std::time::{Duration, Instant};

use crate::config::HealthCheckConfig;
use crate::load_balancer::HealthState;

/// Outcome of one liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub success: bool,
    pub at: Instant,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(latency: Duration) -> Self {
        Self {
            success: true,
            at: Instant::now(),
            latency,
            error: None,
        }
    }

    pub fn failure(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            at: Instant::now(),
            latency,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Consecutive failures that take a healthy backend out (N).
    pub unhealthy: u32,
    /// Consecutive successes that bring it back (M).
    pub healthy: u32,
}

impl From<&HealthCheckConfig> for Thresholds {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            unhealthy: config.unhealthy_threshold.max(1),
            healthy: config.healthy_threshold.max(1),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&HealthCheckConfig::default())
    }
}

/// Debounced per-backend tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTracker {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl HealthTracker {
    /// Start tracking from the backend's current registry state.
    pub fn starting_at(state: HealthState) -> Self {
        Self {
            healthy: state == HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        if self.healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        }
    }

    /// Feed one probe outcome. Returns the new state when it changed.
    pub fn observe(&mut self, success: bool, thresholds: Thresholds) -> Option<HealthState> {
        if success {
            self.consecutive_failures = 0;
            if self.healthy {
                return None;
            }
            self.consecutive_successes += 1;
            if self.consecutive_successes >= thresholds.healthy {
                self.healthy = true;
                self.consecutive_successes = 0;
                return Some(HealthState::Healthy);
            }
        } else {
            self.consecutive_successes = 0;
            if !self.healthy {
                return None;
            }
            self.consecutive_failures += 1;
            if self.consecutive_failures >= thresholds.unhealthy {
                self.healthy = false;
                self.consecutive_failures = 0;
                return Some(HealthState::Unhealthy);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Thresholds = Thresholds { unhealthy: 3, healthy: 2 };

    #[test]
    fn three_failures_mark_unhealthy() {
        let mut tracker = HealthTracker::starting_at(HealthState::Healthy);
        assert_eq!(tracker.observe(false, T), None);
        assert_eq!(tracker.observe(false, T), None);
        assert_eq!(tracker.observe(false, T), Some(HealthState::Unhealthy));
        assert_eq!(tracker.observe(false, T), None);
    }

    #[test]
    fn two_successes_restore() {
        let mut tracker = HealthTracker::starting_at(HealthState::Unhealthy);
        assert_eq!(tracker.observe(true, T), None);
        assert_eq!(tracker.state(), HealthState::Unhealthy);
        assert_eq!(tracker.observe(true, T), Some(HealthState::Healthy));
    }

    #[test]
    fn broken_streaks_do_not_flap() {
        let mut tracker = HealthTracker::starting_at(HealthState::Healthy);
        for _ in 0..10 {
            assert_eq!(tracker.observe(false, T), None);
            assert_eq!(tracker.observe(false, T), None);
            assert_eq!(tracker.observe(true, T), None);
        }
        assert_eq!(tracker.state(), HealthState::Healthy);

        let mut tracker = HealthTracker::starting_at(HealthState::Unhealthy);
        for _ in 0..10 {
            assert_eq!(tracker.observe(true, T), None);
            assert_eq!(tracker.observe(false, T), None);
        }
        assert_eq!(tracker.state(), HealthState::Unhealthy);
    }
}
