//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher, prober, circuit breakers produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (per-backend counters, histograms, health gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint
//!     → admin API (GET /admin/metrics)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through all log lines of a request
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{init_exporter, BackendMetrics, MetricsSink};
