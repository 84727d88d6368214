//! Client session tracking.
//!
//! # Responsibilities
//! - Give each proxied client session a unique ID for log correlation
//! - Count live sessions so shutdown can wait for them to finish

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Shared {
    active: AtomicUsize,
    idle: Notify,
}

/// Counts live sessions. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    shared: Arc<Shared>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session. The count drops when the guard does.
    pub fn track(&self) -> SessionGuard {
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            shared: self.shared.clone(),
            id: SessionId::next(),
        }
    }

    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Wait until no session is live, or `limit` passes. Returns `true` when idle.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.shared.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

#[derive(Debug)]
pub struct SessionGuard {
    shared: Arc<Shared>,
    id: SessionId,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.shared.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
        tracing::trace!(session = %self.id, "Session closed");
    }
}
