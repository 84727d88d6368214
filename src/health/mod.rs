//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer or forced trigger
//!     → probe.rs (TCP connect or HTTP GET, bounded by the probe timeout)
//!     → state.rs (debounced tracker per backend)
//!     → Registry::update_health on transition
//! ```
//!
//! # Design Decisions
//! - The prober is the only writer of probe-driven health
//! - State transitions require consecutive successes/failures
//! - Draining backends are skipped entirely
//! - Probe failures become log and metric events, never errors

pub mod active;
pub mod probe;
pub mod state;

pub use active::{HealthMonitor, ProbeTrigger};
pub use probe::{ConfiguredProbe, HttpProbe, Probe, TcpProbe};
pub use state::{HealthTracker, ProbeResult, Thresholds};
