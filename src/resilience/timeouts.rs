//! Timeout enforcement.
//!
//! # Responsibilities
//! - Carry an absolute request deadline across retries
//! - Bound each attempt by the smaller of its own timeout and what is left
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; expiry drops (cancels) the attempt future
//! - Timeout errors are distinct from other upstream errors

use std::future::Future;
use std::time::{Duration, Instant};

/// Absolute point in time by which a request must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Budget for one attempt: its own cap, clipped to the remaining deadline.
    pub fn attempt_budget(&self, per_attempt: Duration) -> Duration {
        self.remaining().min(per_attempt)
    }
}

/// Run `fut` for at most `limit`. `Err(limit)` means it was cancelled.
pub async fn within<F: Future>(limit: Duration, fut: F) -> Result<F::Output, Duration> {
    tokio::time::timeout(limit, fut).await.map_err(|_| limit)
}
