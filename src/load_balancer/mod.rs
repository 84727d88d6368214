//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher admits request
//!     → registry.rs (take an immutable snapshot)
//!     → Apply the active policy:
//!         - round_robin.rs (rotate through backends)
//!         - least_conn.rs (pick backend with fewest in-flight requests)
//!         - weighted.rs (random, proportional to weight)
//!         - random.rs (uniform random)
//!         - consistent_hash.rs (sticky client key on a hash ring)
//!     → registry.rs (acquire an in-flight lease)
//! ```
//!
//! # Design Decisions
//! - Policies never mutate the registry; they only read snapshots
//! - Unhealthy, Draining and per-request excluded backends are never selected
//! - The active policy can be swapped at runtime without blocking selection

pub mod backend;
pub mod consistent_hash;
pub mod context;
pub mod least_conn;
pub mod random;
pub mod registry;
pub mod round_robin;
pub mod weighted;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use self::backend::BackendView;
use self::context::RequestContext;
use self::registry::Snapshot;

pub use self::backend::{BackendId, HealthState};
pub use self::registry::{InFlightLease, Registry, RegistryError};

/// Selection failed because nothing is eligible.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no available backend")]
    NoAvailableBackend,
}

/// A load balancing strategy.
pub trait Policy: Send + Sync + fmt::Debug {
    /// Choose a backend from `snapshot` for the request described by `ctx`.
    fn select(&self, snapshot: &Snapshot, ctx: &RequestContext) -> Result<BackendView, SelectError>;

    fn name(&self) -> &'static str;
}

/// Backends a policy may choose from, in registration order.
pub fn eligible<'a>(snapshot: &'a Snapshot, ctx: &RequestContext) -> Vec<&'a BackendView> {
    snapshot
        .backends()
        .iter()
        .filter(|b| b.health.is_selectable() && !ctx.is_excluded(&b.id))
        .collect()
}

/// Configurable strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRandom,
    Random,
    ConsistentHash,
}

impl Strategy {
    pub fn build(self) -> Box<dyn Policy> {
        match self {
            Strategy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
            Strategy::LeastConnections => Box::new(least_conn::LeastConnections::new()),
            Strategy::WeightedRandom => Box::new(weighted::WeightedRandom::new()),
            Strategy::Random => Box::new(random::Random::new()),
            Strategy::ConsistentHash => Box::new(consistent_hash::ConsistentHash::new()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::WeightedRandom => "weighted_random",
            Strategy::Random => "random",
            Strategy::ConsistentHash => "consistent_hash",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown strategy '{0}' (expected roundrobin, leastconn, weighted, random or hash)")]
pub struct ParseStrategyError(String);

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "roundrobin" | "rr" => Ok(Strategy::RoundRobin),
            "leastconn" | "leastconnections" => Ok(Strategy::LeastConnections),
            "weighted" | "weightedrandom" => Ok(Strategy::WeightedRandom),
            "random" => Ok(Strategy::Random),
            "hash" | "consistenthash" | "sticky" => Ok(Strategy::ConsistentHash),
            _ => Err(ParseStrategyError(s.to_string())),
        }
    }
}

struct ActivePolicy {
    strategy: Strategy,
    policy: Box<dyn Policy>,
}

/// Shared, swappable handle to the active policy.
pub struct PolicyHandle {
    current: ArcSwap<ActivePolicy>,
}

impl PolicyHandle {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            current: ArcSwap::from_pointee(ActivePolicy {
                strategy,
                policy: strategy.build(),
            }),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.current.load().strategy
    }

    /// Replace the active policy. Selection state (cursors, rings) starts fresh.
    pub fn set_strategy(&self, strategy: Strategy) {
        if self.strategy() == strategy {
            return;
        }
        self.current.store(Arc::new(ActivePolicy {
            strategy,
            policy: strategy.build(),
        }));
        tracing::info!(strategy = %strategy, "Load balancing strategy changed");
    }

    pub fn select(&self, snapshot: &Snapshot, ctx: &RequestContext) -> Result<BackendView, SelectError> {
        self.current.load().policy.select(snapshot, ctx)
    }
}

impl fmt::Debug for PolicyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyHandle")
            .field("strategy", &self.strategy())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn snapshot_of(backends: Vec<BackendView>) -> Snapshot {
        Snapshot::new(1, 1, backends)
    }

    pub fn three_healthy() -> Snapshot {
        snapshot_of(vec![
            BackendView::new("10.0.0.1", 80),
            BackendView::new("10.0.0.2", 80),
            BackendView::new("10.0.0.3", 80),
        ])
    }
}
