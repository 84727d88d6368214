//! Weighted random load balancing strategy.

use std::sync::{Mutex, PoisonError};

use crate::load_balancer::backend::BackendView;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::registry::Snapshot;
use crate::load_balancer::{eligible, Policy, SelectError};

/// Picks a healthy backend with probability proportional to its weight.
#[derive(Debug)]
pub struct WeightedRandom {
    rng: Mutex<fastrand::Rng>,
}

impl WeightedRandom {
    pub fn new() -> Self {
        Self::with_seed(fastrand::u64(..))
    }

    /// Fixed seed for reproducible selection sequences.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for WeightedRandom {
    fn select(&self, snapshot: &Snapshot, ctx: &RequestContext) -> Result<BackendView, SelectError> {
        let candidates = eligible(snapshot, ctx);
        let total: u64 = candidates.iter().map(|b| u64::from(b.weight.max(1))).sum();
        if total == 0 {
            return Err(SelectError::NoAvailableBackend);
        }

        let mut point = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .u64(0..total);
        for backend in &candidates {
            let weight = u64::from(backend.weight.max(1));
            if point < weight {
                return Ok((*backend).clone());
            }
            point -= weight;
        }
        // Unreachable while `point < total`; keep the last candidate as a floor.
        candidates
            .last()
            .map(|b| (*b).clone())
            .ok_or(SelectError::NoAvailableBackend)
    }

    fn name(&self) -> &'static str {
        "weighted_random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::*;

    #[test]
    fn follows_weights() {
        let lb = WeightedRandom::with_seed(7);
        let snapshot = snapshot_of(vec![
            BackendView::new("10.0.0.1", 80).with_weight(3),
            BackendView::new("10.0.0.2", 80).with_weight(1),
        ]);

        let mut heavy = 0;
        for _ in 0..4000 {
            if lb.select(&snapshot, &RequestContext::new()).unwrap().id == snapshot.backends()[0].id {
                heavy += 1;
            }
        }
        // Expected 3000; allow generous slack.
        assert!((2700..=3300).contains(&heavy), "heavy = {}", heavy);
    }

    #[test]
    fn same_seed_same_sequence() {
        let snapshot = three_healthy();
        let a = WeightedRandom::with_seed(42);
        let b = WeightedRandom::with_seed(42);
        for _ in 0..50 {
            assert_eq!(
                a.select(&snapshot, &RequestContext::new()).unwrap().id,
                b.select(&snapshot, &RequestContext::new()).unwrap().id
            );
        }
    }
}
