//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every non-draining backend
//! - Debounce outcomes through per-backend trackers
//! - Write resulting health transitions into the registry
//! - Run an extra round on demand (admin "force re-check")

use std::collections::HashMap;
use std::sync::Arc;
use futures_util::future::join_all;
use tokio::sync::{broadcast, Notify};
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::health::probe::Probe;
use crate::health::state::{HealthTracker, ProbeResult, Thresholds};
use crate::load_balancer::{BackendId, HealthState, Registry};
use crate::observability::metrics::MetricsSink;

/// Handle that asks a running prober for an immediate round.
#[derive(Debug, Clone, Default)]
pub struct ProbeTrigger {
    notify: Arc<Notify>,
}

impl ProbeTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a round. Coalesces with any request not yet picked up.
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn fired(&self) {
        self.notify.notified().await;
    }
}

pub struct HealthMonitor<P> {
    registry: Arc<Registry>,
    metrics: Arc<MetricsSink>,
    probe: P,
    config: HealthCheckConfig,
    thresholds: Thresholds,
    trackers: HashMap<BackendId, HealthTracker>,
    trigger: ProbeTrigger,
}

impl<P: Probe> HealthMonitor<P> {
    pub fn new(
        registry: Arc<Registry>,
        metrics: Arc<MetricsSink>,
        probe: P,
        config: HealthCheckConfig,
        trigger: ProbeTrigger,
    ) -> Self {
        let thresholds = Thresholds::from(&config);
        Self {
            registry,
            metrics,
            probe,
            config,
            thresholds,
            trackers: HashMap::new(),
            trigger,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval_ms = self.config.interval_ms,
            timeout_ms = self.config.timeout_ms,
            kind = ?self.config.kind,
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let trigger = self.trigger.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = trigger.fired() => {
                    tracing::debug!("Forced health check round");
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every eligible backend once and apply the outcomes.
    pub async fn check_all(&mut self) -> Vec<(BackendId, ProbeResult)> {
        let snapshot = self.registry.snapshot();
        // A drained backend starts over from its registry state when it returns.
        self.trackers
            .retain(|id, _| snapshot.get(id).is_some_and(|b| b.health != HealthState::Draining));

        let targets: Vec<_> = snapshot
            .backends()
            .iter()
            .filter(|b| b.health != HealthState::Draining)
            .collect();

        let probe = &self.probe;
        let results = join_all(targets.iter().map(|target| probe.probe(target))).await;

        let mut outcomes = Vec::with_capacity(results.len());
        for (target, result) in targets.into_iter().zip(results) {
            if !result.success {
                tracing::warn!(
                    backend = %target.id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    latency_ms = result.latency.as_millis() as u64,
                    "Health probe failed"
                );
            }
            self.metrics.record_probe(&target.id, &result);

            let tracker = self
                .trackers
                .entry(target.id.clone())
                .or_insert_with(|| HealthTracker::starting_at(target.health));
            if tracker.state() != target.health {
                *tracker = HealthTracker::starting_at(target.health);
            }
            if let Some(state) = tracker.observe(result.success, self.thresholds) {
                if let Err(e) = self.registry.update_health(&target.id, state) {
                    tracing::debug!(backend = %target.id, error = %e, "Backend vanished during probe");
                }
            }
            outcomes.push((target.id.clone(), result));
        }
        outcomes
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::load_balancer::backend::BackendView;
    use crate::load_balancer::context::RequestContext;
    use crate::load_balancer::round_robin::RoundRobin;
    use crate::load_balancer::Policy;
    use dashmap::DashMap;
    use std::time::Duration;

    /// Probe whose answers are set per backend by the test.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedProbe {
        pub answers: Arc<DashMap<BackendId, bool>>,
        pub calls: Arc<DashMap<BackendId, usize>>,
    }

    impl Probe for ScriptedProbe {
        async fn probe(&self, target: &BackendView) -> ProbeResult {
            *self.calls.entry(target.id.clone()).or_insert(0) += 1;
            let ok = self.answers.get(&target.id).map_or(true, |v| *v);
            if ok {
                ProbeResult::success(Duration::from_millis(1))
            } else {
                ProbeResult::failure(Duration::from_millis(1), "scripted failure")
            }
        }
    }

    fn setup() -> (Arc<Registry>, ScriptedProbe, HealthMonitor<ScriptedProbe>) {
        let registry = Arc::new(
            Registry::from_configs(&[
                BackendConfig::new("10.0.0.1", 80),
                BackendConfig::new("10.0.0.2", 80),
                BackendConfig::new("10.0.0.3", 80),
            ])
            .unwrap(),
        );
        let probe = ScriptedProbe::default();
        let monitor = HealthMonitor::new(
            registry.clone(),
            Arc::new(MetricsSink::new()),
            probe.clone(),
            HealthCheckConfig::default(),
            ProbeTrigger::new(),
        );
        (registry, probe, monitor)
    }

    #[tokio::test]
    async fn failing_backend_is_evicted_and_restored() {
        let (registry, probe, mut monitor) = setup();
        let b = BackendId::new("10.0.0.2", 80);
        let lb = RoundRobin::new();
        probe.answers.insert(b.clone(), false);

        monitor.check_all().await;
        monitor.check_all().await;
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Healthy);
        monitor.check_all().await;
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Unhealthy);

        for _ in 0..12 {
            let picked = lb.select(&registry.snapshot(), &RequestContext::new()).unwrap();
            assert_ne!(picked.id, b);
        }

        probe.answers.insert(b.clone(), true);
        monitor.check_all().await;
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Unhealthy);
        for _ in 0..6 {
            let picked = lb.select(&registry.snapshot(), &RequestContext::new()).unwrap();
            assert_ne!(picked.id, b);
        }

        monitor.check_all().await;
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Healthy);
        let seen: Vec<_> = (0..3)
            .map(|_| lb.select(&registry.snapshot(), &RequestContext::new()).unwrap().id)
            .collect();
        assert!(seen.contains(&b));
    }

    #[tokio::test]
    async fn draining_backends_are_not_probed() {
        let (registry, probe, mut monitor) = setup();
        let drained = BackendId::new("10.0.0.3", 80);
        registry.drain(&drained).unwrap();

        let outcomes = monitor.check_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(probe.calls.get(&drained).is_none());
        assert_eq!(registry.get(&drained).unwrap().health, HealthState::Draining);
    }

    #[tokio::test]
    async fn undrained_backend_is_evicted_again_after_failures() {
        let (registry, probe, mut monitor) = setup();
        let b = BackendId::new("10.0.0.2", 80);
        probe.answers.insert(b.clone(), false);
        for _ in 0..3 {
            monitor.check_all().await;
        }
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Unhealthy);

        registry.drain(&b).unwrap();
        monitor.check_all().await;
        registry.undrain(&b).unwrap();
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Healthy);

        monitor.check_all().await;
        monitor.check_all().await;
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Healthy);
        monitor.check_all().await;
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn undrain_without_an_intervening_round_still_resets_the_tracker() {
        let (registry, probe, mut monitor) = setup();
        let b = BackendId::new("10.0.0.2", 80);
        probe.answers.insert(b.clone(), false);
        for _ in 0..3 {
            monitor.check_all().await;
        }
        registry.drain(&b).unwrap();
        registry.undrain(&b).unwrap();

        for _ in 0..3 {
            monitor.check_all().await;
        }
        assert_eq!(registry.get(&b).unwrap().health, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn trigger_runs_an_immediate_round() {
        let registry = Arc::new(Registry::from_configs(&[BackendConfig::new("10.0.0.1", 80)]).unwrap());
        let probe = ScriptedProbe::default();
        let trigger = ProbeTrigger::new();
        let config = HealthCheckConfig {
            interval_ms: 60_000,
            ..HealthCheckConfig::default()
        };
        let monitor = HealthMonitor::new(
            registry,
            Arc::new(MetricsSink::new()),
            probe.clone(),
            config,
            trigger.clone(),
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(monitor.run(rx));

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.fire();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = BackendId::new("10.0.0.1", 80);
        assert_eq!(probe.calls.get(&id).map(|c| *c), Some(2));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
