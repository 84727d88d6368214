//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Keep per-backend counters readable in-process (admin API, tests)
//! - Mirror them to the `metrics` facade for Prometheus scraping
//!
//! # Metrics
//! - `lb_requests_total` (counter): attempts by backend
//! - `lb_request_errors_total` (counter): failed attempts by backend, reason
//! - `lb_request_duration_seconds` (histogram): attempt latency by backend
//! - `lb_probe_failures_total` (counter): failed health probes by backend
//! - `lb_backend_health` (gauge): 1=healthy, 0=otherwise
//! - `lb_backend_in_flight` (gauge): outstanding attempts by backend
//!
//! The two gauges are maintained by the registry's backend records, where
//! health and in-flight counts change.

use dashmap::DashMap;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::health::state::ProbeResult;
use crate::load_balancer::registry::Snapshot;
use crate::load_balancer::{BackendId, HealthState};

/// Upper bounds of the latency buckets, in milliseconds. A final overflow
/// bucket catches everything slower.
pub const LATENCY_BUCKETS_MS: [u64; 12] = [1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

#[derive(Debug, Default)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let index = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_micros = self.sum_micros.load(Ordering::Relaxed);
        HistogramSnapshot {
            bounds_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                sum_micros as f64 / count as f64 / 1_000.0
            },
        }
    }
}

#[derive(Debug, Default)]
struct BackendStats {
    requests: AtomicU64,
    errors: AtomicU64,
    probe_failures: AtomicU64,
    latency: LatencyHistogram,
}

/// Exported view of a latency histogram. `counts` has one more entry than
/// `bounds_ms`: the overflow bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub bounds_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub count: u64,
    pub mean_ms: f64,
}

/// Exported per-backend metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendMetrics {
    pub backend: BackendId,
    pub health: Option<HealthState>,
    pub in_flight: usize,
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub probe_failures: u64,
    pub latency: HistogramSnapshot,
}

/// In-process metrics store shared by the dispatcher and the prober.
#[derive(Debug, Default)]
pub struct MetricsSink {
    backends: DashMap<BackendId, BackendStats>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// An attempt was sent to `id`.
    pub fn record_attempt(&self, id: &BackendId) {
        self.backends
            .entry(id.clone())
            .or_default()
            .requests
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lb_requests_total", "backend" => id.to_string()).increment(1);
    }

    pub fn record_success(&self, id: &BackendId, latency: Duration) {
        self.backends.entry(id.clone()).or_default().latency.record(latency);
        metrics::histogram!("lb_request_duration_seconds", "backend" => id.to_string())
            .record(latency.as_secs_f64());
    }

    pub fn record_failure(&self, id: &BackendId, latency: Duration, reason: &'static str) {
        {
            let stats = self.backends.entry(id.clone()).or_default();
            stats.errors.fetch_add(1, Ordering::Relaxed);
            stats.latency.record(latency);
        }
        metrics::counter!("lb_request_errors_total", "backend" => id.to_string(), "reason" => reason).increment(1);
        metrics::histogram!("lb_request_duration_seconds", "backend" => id.to_string())
            .record(latency.as_secs_f64());
    }

    pub fn record_probe(&self, id: &BackendId, result: &ProbeResult) {
        if result.success {
            return;
        }
        self.backends
            .entry(id.clone())
            .or_default()
            .probe_failures
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lb_probe_failures_total", "backend" => id.to_string()).increment(1);
    }

    pub fn forget(&self, id: &BackendId) {
        self.backends.remove(id);
    }

    /// Metrics for every backend in `snapshot`, plus any with recorded history
    /// that has since left it (reported without health).
    pub fn export(&self, snapshot: &Snapshot) -> Vec<BackendMetrics> {
        let mut out: Vec<BackendMetrics> = snapshot
            .backends()
            .iter()
            .map(|b| self.export_one(&b.id, Some(b.health), b.in_flight))
            .collect();
        for entry in self.backends.iter() {
            if snapshot.get(entry.key()).is_none() {
                out.push(self.export_stats(entry.key(), &entry, None, 0));
            }
        }
        out
    }

    fn export_one(&self, id: &BackendId, health: Option<HealthState>, in_flight: usize) -> BackendMetrics {
        match self.backends.get(id) {
            Some(stats) => self.export_stats(id, &stats, health, in_flight),
            None => self.export_stats(id, &BackendStats::default(), health, in_flight),
        }
    }

    fn export_stats(
        &self,
        id: &BackendId,
        stats: &BackendStats,
        health: Option<HealthState>,
        in_flight: usize,
    ) -> BackendMetrics {
        let requests = stats.requests.load(Ordering::Relaxed);
        let errors = stats.errors.load(Ordering::Relaxed);
        BackendMetrics {
            backend: id.clone(),
            health,
            in_flight,
            requests,
            errors,
            error_rate: if requests == 0 { 0.0 } else { errors as f64 / requests as f64 },
            probe_failures: stats.probe_failures.load(Ordering::Relaxed),
            latency: stats.latency.snapshot(),
        }
    }
}

/// Install the global Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::backend::BackendView;

    #[test]
    fn histogram_buckets_by_upper_bound() {
        let histogram = LatencyHistogram::default();
        histogram.record(Duration::from_micros(500));
        histogram.record(Duration::from_millis(5));
        histogram.record(Duration::from_millis(7));
        histogram.record(Duration::from_secs(60));

        let snap = histogram.snapshot();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.counts[0], 1);
        assert_eq!(snap.counts[1], 1);
        assert_eq!(snap.counts[2], 1);
        assert_eq!(*snap.counts.last().unwrap(), 1);
        assert_eq!(snap.counts.len(), snap.bounds_ms.len() + 1);
    }

    #[test]
    fn export_reports_rates_and_in_flight() {
        let sink = MetricsSink::new();
        let a = BackendId::new("10.0.0.1", 80);
        for _ in 0..4 {
            sink.record_attempt(&a);
        }
        sink.record_success(&a, Duration::from_millis(3));
        sink.record_failure(&a, Duration::from_millis(3), "timeout");
        sink.record_probe(&a, &ProbeResult::failure(Duration::ZERO, "down"));
        sink.record_probe(&a, &ProbeResult::success(Duration::ZERO));

        let snapshot = Snapshot::new(1, 1, vec![BackendView::new("10.0.0.1", 80).with_in_flight(2)]);
        let exported = sink.export(&snapshot);
        assert_eq!(exported.len(), 1);
        let m = &exported[0];
        assert_eq!(m.requests, 4);
        assert_eq!(m.errors, 1);
        assert_eq!(m.error_rate, 0.25);
        assert_eq!(m.probe_failures, 1);
        assert_eq!(m.in_flight, 2);
        assert_eq!(m.health, Some(HealthState::Healthy));
        assert_eq!(m.latency.count, 2);
    }

    #[test]
    fn departed_backends_still_export_history() {
        let sink = MetricsSink::new();
        let gone = BackendId::new("10.0.0.9", 80);
        sink.record_attempt(&gone);
        let exported = sink.export(&Snapshot::new(1, 1, Vec::new()));
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].health, None);

        sink.forget(&gone);
        assert!(sink.export(&Snapshot::new(1, 1, Vec::new())).is_empty());
    }
}
