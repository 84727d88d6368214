//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, ports valid, addresses parse)
//! - Detect duplicate backends
//! - Keep the probe timeout shorter than the dispatch deadline
//!
//! Returns all validation errors, not just the first.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{BackendConfig, BalancerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: '{value}' is not a valid socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("backend #{index}: host must not be empty")]
    EmptyHost { index: usize },

    #[error("backend #{index}: port must be non-zero")]
    ZeroPort { index: usize },

    #[error("backend #{index}: weight must be positive")]
    ZeroWeight { index: usize },

    #[error("backend {0} is listed more than once")]
    DuplicateBackend(String),

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("health_check.timeout_ms ({probe_ms}) must be shorter than dispatch.deadline_ms ({deadline_ms})")]
    ProbeTimeoutTooLong { probe_ms: u64, deadline_ms: u64 },

    #[error("dispatch.retry_budget_ratio must be a finite, non-negative number")]
    InvalidBudgetRatio,

    #[error("health_check.path must start with '/'")]
    InvalidProbePath,

    #[error("admin.api_key must not be empty when the admin API is enabled")]
    EmptyApiKey,
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_positive(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::MustBePositive(field));
    }
}

fn check_backend(errors: &mut Vec<ValidationError>, index: usize, backend: &BackendConfig) {
    if backend.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost { index });
    }
    if backend.port == 0 {
        errors.push(ValidationError::ZeroPort { index });
    }
    if backend.weight == 0 {
        errors.push(ValidationError::ZeroWeight { index });
    }
}

/// Validate a single backend added at runtime.
pub fn validate_backend(backend: &BackendConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_backend(&mut errors, 0, backend);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    check_positive(&mut errors, "listener.max_connections", config.listener.max_connections as u64);
    check_positive(&mut errors, "listener.max_body_bytes", config.listener.max_body_bytes as u64);

    let mut seen = HashSet::new();
    for (index, backend) in config.backends.iter().enumerate() {
        check_backend(&mut errors, index, backend);
        if !seen.insert(backend.id()) {
            errors.push(ValidationError::DuplicateBackend(backend.id().to_string()));
        }
    }

    let health = &config.health_check;
    check_positive(&mut errors, "health_check.interval_ms", health.interval_ms);
    check_positive(&mut errors, "health_check.timeout_ms", health.timeout_ms);
    check_positive(&mut errors, "health_check.unhealthy_threshold", health.unhealthy_threshold.into());
    check_positive(&mut errors, "health_check.healthy_threshold", health.healthy_threshold.into());
    if !health.path.starts_with('/') {
        errors.push(ValidationError::InvalidProbePath);
    }

    let dispatch = &config.dispatch;
    check_positive(&mut errors, "dispatch.deadline_ms", dispatch.deadline_ms);
    check_positive(&mut errors, "dispatch.attempt_timeout_ms", dispatch.attempt_timeout_ms);
    check_positive(&mut errors, "dispatch.max_attempts", dispatch.max_attempts.into());
    if health.enabled && health.timeout_ms >= dispatch.deadline_ms {
        errors.push(ValidationError::ProbeTimeoutTooLong {
            probe_ms: health.timeout_ms,
            deadline_ms: dispatch.deadline_ms,
        });
    }
    if !dispatch.retry_budget_ratio.is_finite() || dispatch.retry_budget_ratio < 0.0 {
        errors.push(ValidationError::InvalidBudgetRatio);
    }

    let breaker = &config.circuit_breaker;
    if breaker.enabled {
        check_positive(&mut errors, "circuit_breaker.failure_threshold", breaker.failure_threshold.into());
        check_positive(&mut errors, "circuit_breaker.window_ms", breaker.window_ms);
        check_positive(&mut errors, "circuit_breaker.open_ms", breaker.open_ms);
    }

    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::EmptyApiKey);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&BalancerConfig::default()), Ok(()));
    }

    #[test]
    fn duplicate_backends_are_rejected() {
        let mut config = BalancerConfig::default();
        config.backends = vec![BackendConfig::new("10.0.0.1", 80), BackendConfig::new("10.0.0.1", 80)];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::DuplicateBackend("10.0.0.1:80".into())]);
    }

    #[test]
    fn probe_timeout_must_undercut_deadline() {
        let mut config = BalancerConfig::default();
        config.health_check.timeout_ms = 5_000;
        config.dispatch.deadline_ms = 2_000;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::ProbeTimeoutTooLong {
            probe_ms: 5_000,
            deadline_ms: 2_000
        }));
    }

    #[test]
    fn bad_addresses_and_zero_weight() {
        let mut config = BalancerConfig::default();
        config.listener.bind_address = "localhost".into();
        config.backends = vec![BackendConfig::new("10.0.0.1", 80).with_weight(0)];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ValidationError::ZeroWeight { index: 0 }));
    }
}
