//! Round-robin load balancing strategy.

use std::sync::{Mutex, PoisonError};

use crate::load_balancer::backend::BackendView;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::registry::Snapshot;
use crate::load_balancer::{eligible, Policy, SelectError};

/// Process-wide rotation counter that restarts whenever registry membership
/// changes.
#[derive(Debug, Default)]
pub(crate) struct RotationCursor {
    inner: Mutex<CursorState>,
}

#[derive(Debug, Default)]
struct CursorState {
    epoch: u64,
    position: usize,
}

impl RotationCursor {
    /// Return the current position and advance by one.
    pub(crate) fn next(&self, epoch: u64) -> usize {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.epoch != epoch {
            state.epoch = epoch;
            state.position = 0;
        }
        let position = state.position;
        state.position = state.position.wrapping_add(1);
        position
    }
}

/// Round-robin selector.
/// Cycles through healthy backends in registration order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: RotationCursor,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Policy for RoundRobin {
    fn select(&self, snapshot: &Snapshot, ctx: &RequestContext) -> Result<BackendView, SelectError> {
        let candidates = eligible(snapshot, ctx);
        if candidates.is_empty() {
            return Err(SelectError::NoAvailableBackend);
        }
        let index = self.cursor.next(snapshot.membership_epoch()) % candidates.len();
        Ok(candidates[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::*;
    use crate::load_balancer::{BackendId, HealthState};
    use std::collections::HashMap;

    fn distribution(lb: &RoundRobin, snapshot: &Snapshot, calls: usize) -> HashMap<BackendId, usize> {
        let mut counts = HashMap::new();
        for _ in 0..calls {
            let picked = lb.select(snapshot, &RequestContext::new()).unwrap();
            *counts.entry(picked.id).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let snapshot = three_healthy();

        let order: Vec<_> = (0..4)
            .map(|_| lb.select(&snapshot, &RequestContext::new()).unwrap().id)
            .collect();
        assert_eq!(order[0], snapshot.backends()[0].id);
        assert_eq!(order[1], snapshot.backends()[1].id);
        assert_eq!(order[2], snapshot.backends()[2].id);
        assert_eq!(order[3], snapshot.backends()[0].id);
    }

    #[test]
    fn six_requests_over_three_backends_split_evenly() {
        let lb = RoundRobin::new();
        let counts = distribution(&lb, &three_healthy(), 6);
        let mut values: Vec<_> = counts.values().copied().collect();
        values.sort();
        assert_eq!(values, vec![2, 2, 2]);
    }

    #[test]
    fn counts_stay_within_floor_and_ceiling() {
        for n in 1..=5usize {
            let backends = (0..n)
                .map(|i| BackendView::new(&format!("10.0.1.{}", i), 80))
                .collect();
            let snapshot = snapshot_of(backends);
            for calls in [1usize, 7, 13, 100] {
                let lb = RoundRobin::new();
                let counts = distribution(&lb, &snapshot, calls);
                for view in snapshot.backends() {
                    let got = counts.get(&view.id).copied().unwrap_or(0);
                    assert!(got == calls / n || got == calls.div_ceil(n), "n={n} calls={calls} got={got}");
                }
            }
        }
    }

    #[test]
    fn skips_unhealthy_and_draining() {
        let lb = RoundRobin::new();
        let snapshot = snapshot_of(vec![
            BackendView::new("10.0.0.1", 80),
            BackendView::new("10.0.0.2", 80).with_health(HealthState::Unhealthy),
            BackendView::new("10.0.0.3", 80).with_health(HealthState::Draining),
        ]);
        for _ in 0..5 {
            assert_eq!(
                lb.select(&snapshot, &RequestContext::new()).unwrap().id,
                BackendId::new("10.0.0.1", 80)
            );
        }
    }

    #[test]
    fn cursor_resets_on_membership_change() {
        let lb = RoundRobin::new();
        let first = Snapshot::new(1, 1, three_healthy().backends().to_vec());
        lb.select(&first, &RequestContext::new()).unwrap();
        lb.select(&first, &RequestContext::new()).unwrap();

        let changed = Snapshot::new(2, 2, three_healthy().backends().to_vec());
        let picked = lb.select(&changed, &RequestContext::new()).unwrap();
        assert_eq!(picked.id, changed.backends()[0].id);
    }

    #[test]
    fn concurrent_selection_stays_fair() {
        let lb = std::sync::Arc::new(RoundRobin::new());
        let snapshot = three_healthy();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = lb.clone();
                let snapshot = snapshot.clone();
                std::thread::spawn(move || distribution(&lb, &snapshot, 300))
            })
            .collect();

        let mut total: HashMap<BackendId, usize> = HashMap::new();
        for handle in handles {
            for (id, n) in handle.join().unwrap() {
                *total.entry(id).or_insert(0) += n;
            }
        }
        for count in total.values() {
            assert_eq!(*count, 400);
        }
    }
}
