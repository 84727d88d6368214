//! Shared balancer state and the administrative operations on it.
//!
//! Front-ends, the prober, the admin API, and the config reloader all hold a
//! clone of [`Balancer`]; clones share the same registry and policy.

use serde::Serialize;
use std::sync::Arc;

use crate::config::{BackendConfig, BalancerConfig, DispatchConfig, HealthCheckConfig};
use crate::dispatch::{Dispatcher, Upstream};
use crate::health::{HealthMonitor, Probe, ProbeTrigger};
use crate::load_balancer::backend::BackendView;
use crate::load_balancer::registry::ReconcileSummary;
use crate::load_balancer::{BackendId, PolicyHandle, Registry, RegistryError, Strategy};
use crate::observability::metrics::{BackendMetrics, MetricsSink};
use crate::resilience::circuit_breaker::{CircuitBreakers, CircuitState};

/// A backend as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub backend: BackendView,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone)]
pub struct Balancer {
    registry: Arc<Registry>,
    policy: Arc<PolicyHandle>,
    breakers: Arc<CircuitBreakers>,
    metrics: Arc<MetricsSink>,
    trigger: ProbeTrigger,
}

impl Balancer {
    pub fn from_config(config: &BalancerConfig) -> Result<Self, RegistryError> {
        Ok(Self {
            registry: Arc::new(Registry::from_configs(&config.backends)?),
            policy: Arc::new(PolicyHandle::new(config.strategy)),
            breakers: Arc::new(CircuitBreakers::new(&config.circuit_breaker)),
            metrics: Arc::new(MetricsSink::new()),
            trigger: ProbeTrigger::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics_sink(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    /// A dispatcher over `upstream` that shares this balancer's state.
    pub fn dispatcher<U: Upstream>(&self, upstream: U, config: &DispatchConfig) -> Dispatcher<U> {
        Dispatcher::new(
            self.registry.clone(),
            self.policy.clone(),
            self.breakers.clone(),
            self.metrics.clone(),
            upstream,
            config,
        )
    }

    /// A health monitor wired to this balancer's registry and trigger.
    pub fn monitor<P: Probe>(&self, probe: P, config: HealthCheckConfig) -> HealthMonitor<P> {
        HealthMonitor::new(
            self.registry.clone(),
            self.metrics.clone(),
            probe,
            config,
            self.trigger.clone(),
        )
    }

    pub fn add_backend(&self, config: &BackendConfig) -> Result<BackendView, RegistryError> {
        self.registry.register(config)
    }

    /// Remove a backend along with its breaker and recorded metrics.
    pub fn remove_backend(&self, id: &BackendId) -> Result<BackendView, RegistryError> {
        let removed = self.registry.deregister(id)?;
        self.breakers.forget(id);
        self.metrics.forget(id);
        Ok(removed)
    }

    pub fn drain_backend(&self, id: &BackendId) -> Result<(), RegistryError> {
        self.registry.drain(id)
    }

    pub fn undrain_backend(&self, id: &BackendId) -> Result<(), RegistryError> {
        self.registry.undrain(id)
    }

    /// Ask the prober for an immediate round.
    pub fn force_health_check(&self) {
        self.trigger.fire();
    }

    pub fn strategy(&self) -> Strategy {
        self.policy.strategy()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        self.policy.set_strategy(strategy);
    }

    pub fn backends(&self) -> Vec<BackendStatus> {
        self.registry
            .snapshot()
            .backends()
            .iter()
            .map(|b| BackendStatus {
                circuit: self.breakers.state(&b.id),
                backend: b.clone(),
            })
            .collect()
    }

    pub fn metrics(&self) -> Vec<BackendMetrics> {
        let snapshot = self.registry.snapshot();
        self.metrics.export(&snapshot)
    }

    /// Apply a reloaded configuration: reconcile membership and weights, then
    /// switch strategy. Other sections take effect on restart.
    pub fn apply_config(&self, config: &BalancerConfig) -> ReconcileSummary {
        let summary = self.registry.reconcile(&config.backends);
        for id in &summary.removed {
            self.breakers.forget(id);
            self.metrics.forget(id);
        }
        self.policy.set_strategy(config.strategy);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::HealthState;

    fn balancer() -> Balancer {
        let config = BalancerConfig {
            backends: vec![BackendConfig::new("10.0.0.1", 80), BackendConfig::new("10.0.0.2", 80)],
            ..BalancerConfig::default()
        };
        Balancer::from_config(&config).unwrap()
    }

    #[test]
    fn admin_errors_are_synchronous() {
        let lb = balancer();
        let err = lb.add_backend(&BackendConfig::new("10.0.0.1", 80)).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(BackendId::new("10.0.0.1", 80)));

        let missing = BackendId::new("10.0.0.9", 80);
        assert_eq!(lb.remove_backend(&missing).unwrap_err(), RegistryError::Unknown(missing.clone()));
        assert_eq!(lb.drain_backend(&missing).unwrap_err(), RegistryError::Unknown(missing));
    }

    #[test]
    fn drain_is_visible_in_backend_listing() {
        let lb = balancer();
        let id = BackendId::new("10.0.0.2", 80);
        lb.drain_backend(&id).unwrap();

        let listed = lb.backends();
        let status = listed.iter().find(|s| s.backend.id == id).unwrap();
        assert_eq!(status.backend.health, HealthState::Draining);
        assert_eq!(status.circuit, CircuitState::Closed);

        lb.undrain_backend(&id).unwrap();
        assert_eq!(lb.registry().get(&id).unwrap().health, HealthState::Healthy);
    }

    #[test]
    fn apply_config_reconciles_and_switches_strategy() {
        let lb = balancer();
        let reloaded = BalancerConfig {
            backends: vec![
                BackendConfig::new("10.0.0.2", 80).with_weight(4),
                BackendConfig::new("10.0.0.3", 80),
            ],
            strategy: Strategy::LeastConnections,
            ..BalancerConfig::default()
        };

        let summary = lb.apply_config(&reloaded);
        assert_eq!(summary.added, vec![BackendId::new("10.0.0.3", 80)]);
        assert_eq!(summary.removed, vec![BackendId::new("10.0.0.1", 80)]);
        assert_eq!(summary.reweighted, vec![BackendId::new("10.0.0.2", 80)]);
        assert_eq!(lb.strategy(), Strategy::LeastConnections);
        assert_eq!(lb.backends().len(), 2);
    }

    #[test]
    fn strategy_can_be_swapped_at_runtime() {
        let lb = balancer();
        assert_eq!(lb.strategy(), Strategy::RoundRobin);
        lb.set_strategy(Strategy::Random);
        assert_eq!(lb.strategy(), Strategy::Random);
    }
}
