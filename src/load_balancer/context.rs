//! Per-request routing metadata.

use std::collections::HashSet;

use crate::load_balancer::backend::BackendId;
use crate::resilience::timeouts::Deadline;

/// Routing metadata carried alongside an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Stable client key for sticky strategies (session token, client IP).
    pub client_key: Option<String>,
    /// Absolute deadline; the dispatcher fills in its default when unset.
    pub deadline: Option<Deadline>,
    /// 1-based number of the attempt currently being routed.
    pub attempt: u32,
    excluded: HashSet<BackendId>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Never route this request to `id` again.
    pub fn exclude(&mut self, id: BackendId) {
        self.excluded.insert(id);
    }

    pub fn is_excluded(&self, id: &BackendId) -> bool {
        self.excluded.contains(id)
    }

    pub fn excluded(&self) -> &HashSet<BackendId> {
        &self.excluded
    }
}
