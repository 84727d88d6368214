//! Backend abstraction.
//!
//! # Responsibilities
//! - Identify a single upstream server by `host:port`
//! - Track in-flight requests (for Least Connections LB)
//! - Track health state (Healthy/Unhealthy/Draining)
//! - Produce plain-value views for registry snapshots
//! - Keep the `lb_backend_in_flight` and `lb_backend_health` gauges current

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::config::BackendConfig;

/// Stable identity of a backend, rendered as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a string is not a valid `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid backend id '{0}', expected host:port")]
pub struct ParseBackendIdError(String);

impl FromStr for BackendId {
    type Err = ParseBackendIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseBackendIdError(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseBackendIdError(s.to_string()));
        }
        let port: u16 = port.parse().map_err(|_| ParseBackendIdError(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy = 0,
    Unhealthy = 1,
    /// Externally requested: receives no new traffic and is not probed.
    Draining = 2,
}

impl HealthState {
    pub fn is_selectable(self) -> bool {
        self == HealthState::Healthy
    }
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            0 => HealthState::Healthy,
            2 => HealthState::Draining,
            // Anything unexpected is treated as unavailable rather than undefined.
            _ => HealthState::Unhealthy,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// A single registered backend server.
///
/// Owned by the [`Registry`](super::registry::Registry); other components only see
/// [`BackendView`] copies or hold an `Arc` through an in-flight lease.
#[derive(Debug)]
pub struct Backend {
    id: BackendId,
    host: String,
    port: u16,
    weight: AtomicU32,
    state: AtomicU8,
    in_flight: AtomicUsize,
}

impl Backend {
    /// Create a new backend. New backends start out `Healthy`.
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            id: config.id(),
            host: config.host.clone(),
            port: config.port,
            weight: AtomicU32::new(config.weight.max(1)),
            state: AtomicU8::new(HealthState::Healthy as u8),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &BackendId {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Acquire)
    }

    pub(crate) fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Release);
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_health(&self, state: HealthState) -> HealthState {
        let previous = HealthState::from(self.state.swap(state as u8, Ordering::AcqRel));
        self.report_health();
        previous
    }

    /// Publish the current health to the `lb_backend_health` gauge (1 = healthy).
    pub(crate) fn report_health(&self) {
        let value = if self.health() == HealthState::Healthy { 1.0 } else { 0.0 };
        metrics::gauge!("lb_backend_health", "backend" => self.id.to_string()).set(value);
    }

    /// Get the current number of in-flight requests.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("lb_backend_in_flight", "backend" => self.id.to_string()).increment(1.0);
    }

    /// Saturating decrement: the counter never wraps below zero.
    pub(crate) fn dec_in_flight(&self) {
        let decremented = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if decremented {
            metrics::gauge!("lb_backend_in_flight", "backend" => self.id.to_string()).decrement(1.0);
        }
    }

    /// Capture the current values into an immutable view.
    pub fn view(&self) -> BackendView {
        BackendView {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight(),
            health: self.health(),
            in_flight: self.in_flight(),
        }
    }
}

/// Point-in-time copy of a backend, as seen inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendView {
    pub id: BackendId,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub health: HealthState,
    pub in_flight: usize,
}

impl BackendView {
    /// Convenience constructor used when assembling snapshots by hand.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            id: BackendId::new(host, port),
            host: host.to_string(),
            port,
            weight: 1,
            health: HealthState::Healthy,
            in_flight: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = health;
        self
    }

    pub fn with_in_flight(mut self, in_flight: usize) -> Self {
        self.in_flight = in_flight;
        self
    }
}
