//! Uniform random load balancing strategy.

use std::sync::{Mutex, PoisonError};

use crate::load_balancer::backend::BackendView;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::registry::Snapshot;
use crate::load_balancer::{eligible, Policy, SelectError};

/// Picks any healthy backend with equal probability, ignoring weights.
#[derive(Debug)]
pub struct Random {
    rng: Mutex<fastrand::Rng>,
}

impl Random {
    pub fn new() -> Self {
        Self::with_seed(fastrand::u64(..))
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for Random {
    fn select(&self, snapshot: &Snapshot, ctx: &RequestContext) -> Result<BackendView, SelectError> {
        let candidates = eligible(snapshot, ctx);
        if candidates.is_empty() {
            return Err(SelectError::NoAvailableBackend);
        }
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usize(0..candidates.len());
        Ok(candidates[index].clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::*;
    use std::collections::HashSet;

    #[test]
    fn reaches_every_backend() {
        let lb = Random::with_seed(1);
        let snapshot = three_healthy();
        let seen: HashSet<_> = (0..200)
            .map(|_| lb.select(&snapshot, &RequestContext::new()).unwrap().id)
            .collect();
        assert_eq!(seen.len(), 3);
    }
}
