//! Least Connections load balancing strategy.

use crate::load_balancer::backend::BackendView;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::registry::Snapshot;
use crate::load_balancer::round_robin::RotationCursor;
use crate::load_balancer::{eligible, Policy, SelectError};

/// Least connections selector.
/// Selects the backend with the minimum number of in-flight requests.
/// Ties rotate round-robin so an idle pool does not herd onto its first member.
#[derive(Debug, Default)]
pub struct LeastConnections {
    tie_breaker: RotationCursor,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Policy for LeastConnections {
    fn select(&self, snapshot: &Snapshot, ctx: &RequestContext) -> Result<BackendView, SelectError> {
        let candidates = eligible(snapshot, ctx);
        let min = candidates
            .iter()
            .map(|b| b.in_flight)
            .min()
            .ok_or(SelectError::NoAvailableBackend)?;

        let tied: Vec<_> = candidates.into_iter().filter(|b| b.in_flight == min).collect();
        let index = self.tie_breaker.next(snapshot.membership_epoch()) % tied.len();
        Ok(tied[index].clone())
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::*;
    use crate::load_balancer::BackendId;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();

        // b1 busy, b2 idle
        let snapshot = snapshot_of(vec![
            BackendView::new("127.0.0.1", 8080).with_in_flight(1),
            BackendView::new("127.0.0.1", 8081),
        ]);
        let s1 = lb.select(&snapshot, &RequestContext::new()).unwrap();
        assert_eq!(s1.id, BackendId::new("127.0.0.1", 8081));

        // now b2 has 2, b1 has 1
        let snapshot = snapshot_of(vec![
            BackendView::new("127.0.0.1", 8080).with_in_flight(1),
            BackendView::new("127.0.0.1", 8081).with_in_flight(2),
        ]);
        let s2 = lb.select(&snapshot, &RequestContext::new()).unwrap();
        assert_eq!(s2.id, BackendId::new("127.0.0.1", 8080));
    }

    #[test]
    fn ties_rotate() {
        let lb = LeastConnections::new();
        let snapshot = three_healthy();
        let picks: Vec<_> = (0..3)
            .map(|_| lb.select(&snapshot, &RequestContext::new()).unwrap().id)
            .collect();
        assert_eq!(picks[0], snapshot.backends()[0].id);
        assert_eq!(picks[1], snapshot.backends()[1].id);
        assert_eq!(picks[2], snapshot.backends()[2].id);
    }

    #[test]
    fn never_picks_a_strictly_busier_backend() {
        let lb = LeastConnections::new();
        let loads = [[3, 1, 1], [0, 5, 0], [7, 7, 2], [4, 4, 4], [9, 0, 1]];
        for load in loads {
            let snapshot = snapshot_of(
                load.iter()
                    .enumerate()
                    .map(|(i, n)| BackendView::new(&format!("10.0.0.{}", i), 80).with_in_flight(*n))
                    .collect(),
            );
            let min = *load.iter().min().unwrap();
            for _ in 0..6 {
                let picked = lb.select(&snapshot, &RequestContext::new()).unwrap();
                assert_eq!(picked.in_flight, min, "load {:?}", load);
            }
        }
    }
}
