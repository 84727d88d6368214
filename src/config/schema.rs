//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::load_balancer::{BackendId, Strategy};

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    /// Inbound listener (bind address, protocol mode).
    pub listener: ListenerConfig,

    /// Statically configured backends.
    pub backends: Vec<BackendConfig>,

    /// Optional JSON file holding an array of backends, merged with `backends`.
    pub backends_file: Option<PathBuf>,

    /// Load balancing strategy.
    pub strategy: Strategy,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Deadline and retry settings for dispatch.
    pub dispatch: DispatchConfig,

    /// Per-backend circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Which protocol the front-end speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontendMode {
    /// Buffered HTTP reverse proxy.
    #[default]
    Http,
    /// Raw layer-4 TCP passthrough.
    Tcp,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    pub mode: FrontendMode,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,

    /// Largest request or response body buffered by the HTTP front-end.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            mode: FrontendMode::Http,
            max_connections: 10_000,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub host: String,

    pub port: u16,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl BackendConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn id(&self) -> BackendId {
        BackendId::new(&self.host, self.port)
    }
}

/// How liveness is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// TCP connect succeeds.
    #[default]
    Tcp,
    /// HTTP GET on `path` returns 2xx.
    Http,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    pub kind: ProbeKind,

    /// Probe round interval in milliseconds.
    pub interval_ms: u64,

    /// Per-probe timeout in milliseconds. Must stay below the dispatch deadline.
    pub timeout_ms: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Tcp,
            interval_ms: 5_000,
            timeout_ms: 1_000,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Dispatch configuration: deadlines and retries.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Total time a request may spend across all attempts, in milliseconds.
    pub deadline_ms: u64,

    /// Cap on a single attempt, in milliseconds.
    pub attempt_timeout_ms: u64,

    /// Total attempts per request, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_backoff_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_backoff_ms: u64,

    /// Retries allowed as a fraction of requests (0.2 = 20%).
    pub retry_budget_ratio: f64,

    /// Retries always allowed regardless of the ratio.
    pub min_retries: u64,

    /// Header carrying the sticky client key (HTTP front-end).
    pub sticky_header: String,
}

impl DispatchConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 10_000,
            attempt_timeout_ms: 3_000,
            max_attempts: 2,
            base_backoff_ms: 10,
            max_backoff_ms: 200,
            retry_budget_ratio: 0.2,
            min_retries: 10,
            sticky_header: "x-lb-session".to_string(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Failures within `window_ms` that open the circuit.
    pub failure_threshold: u32,

    pub window_ms: u64,

    /// Time an open circuit waits before allowing a trial request.
    pub open_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            window_ms: 10_000,
            open_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
