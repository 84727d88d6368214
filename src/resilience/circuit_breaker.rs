//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, excluded from selection
//! - Half-Open: one trial request decides recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold within window
//! Open → Half-Open: after open duration
//! Half-Open → Closed: trial request succeeds
//! Half-Open → Open: trial request fails
//! ```
//!
//! Breakers react within a handful of requests. They never touch registry
//! health; the prober runs its own, slower state machine.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;
use crate::load_balancer::BackendId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window: Duration,
    pub open_duration: Duration,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            window: Duration::from_millis(config.window_ms),
            open_duration: Duration::from_millis(config.open_ms),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every trial claim so a stale permit cannot release a newer trial.
    trial_generation: u64,
}

/// Per-backend breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                trial_generation: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Would a request be let through at `now`? Does not claim the half-open trial.
    pub fn permits(&self, now: Instant) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooled_down(&inner, now),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Claim permission for one request. In half-open only one caller wins.
    ///
    /// The returned permit must be held until the outcome is recorded. If it
    /// is dropped first, a claimed half-open trial is handed back.
    pub fn try_acquire(self: &Arc<Self>, now: Instant) -> Option<BreakerPermit> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(BreakerPermit::unguarded()),
            CircuitState::Open if !self.cooled_down(&inner, now) => None,
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                inner.trial_generation = inner.trial_generation.wrapping_add(1);
                Some(BreakerPermit {
                    trial: Some((self.clone(), inner.trial_generation)),
                })
            }
        }
    }

    /// Give back a trial whose request ended without an outcome.
    fn abandon_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight && inner.trial_generation == generation {
            inner.trial_in_flight = false;
            tracing::debug!("Half-open trial abandoned");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.trial_in_flight = false;
        }
    }

    /// Record a failure. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                Self::open(&mut inner, now);
                true
            }
            CircuitState::Open => false,
            CircuitState::Closed => {
                inner.failures.push_back(now);
                let window = self.settings.window;
                while let Some(first) = inner.failures.front() {
                    if now.saturating_duration_since(*first) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.settings.failure_threshold {
                    Self::open(&mut inner, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn open(inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.failures.clear();
    }

    fn cooled_down(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .opened_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.settings.open_duration)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission to send one request through a breaker.
///
/// Dropping it after the outcome was recorded is a no-op. Dropping it while
/// the half-open trial is still claimed frees the trial for the next request.
#[derive(Debug)]
#[must_use = "dropping the permit releases a half-open trial"]
pub struct BreakerPermit {
    trial: Option<(Arc<CircuitBreaker>, u64)>,
}

impl BreakerPermit {
    fn unguarded() -> Self {
        Self { trial: None }
    }

    /// Whether this permit holds the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if let Some((breaker, generation)) = self.trial.take() {
            breaker.abandon_trial(generation);
        }
    }
}

/// Breakers for every backend, created on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    enabled: bool,
    settings: BreakerSettings,
    breakers: DashMap<BackendId, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            settings: BreakerSettings::from(config),
            breakers: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, id: &BackendId) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(id) {
            return breaker.clone();
        }
        self.breakers
            .entry(id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.settings)))
            .clone()
    }

    pub fn permits(&self, id: &BackendId, now: Instant) -> bool {
        !self.enabled || self.breakers.get(id).map_or(true, |b| b.permits(now))
    }

    pub fn try_acquire(&self, id: &BackendId, now: Instant) -> Option<BreakerPermit> {
        if !self.enabled {
            return Some(BreakerPermit::unguarded());
        }
        self.get(id).try_acquire(now)
    }

    pub fn record_success(&self, id: &BackendId) {
        if self.enabled {
            self.get(id).record_success();
        }
    }

    pub fn record_failure(&self, id: &BackendId, now: Instant) {
        if self.enabled && self.get(id).record_failure(now) {
            tracing::warn!(backend = %id, "Circuit opened");
            metrics::counter!("lb_circuit_opened_total", "backend" => id.to_string()).increment(1);
        }
    }

    pub fn state(&self, id: &BackendId) -> CircuitState {
        self.breakers
            .get(id)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    pub fn forget(&self, id: &BackendId) {
        self.breakers.remove(id);
    }
}
