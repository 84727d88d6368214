//! Request dispatch.
//!
//! # Data Flow
//! ```text
//! Front-end (HTTP handler or TCP accept loop)
//!     → Dispatcher::handle
//!         → Registry::snapshot → Policy::select (minus failed / open-circuit backends)
//!         → Registry::acquire (in-flight lease)
//!         → Upstream::call, bounded by the remaining deadline
//!         → MetricsSink + CircuitBreakers record the outcome
//!     ← Routed { response, lease } or DispatchError
//! ```
//!
//! # Design Decisions
//! - The dispatcher is protocol-agnostic; framing lives in `Upstream` impls
//! - Retries always go to a backend not yet tried by this request
//! - The lease is handed to the caller with the response

pub mod dispatcher;

use std::future::Future;
use std::time::Duration;

use crate::load_balancer::backend::BackendView;
use crate::load_balancer::SelectError;

pub use dispatcher::{Dispatcher, Routed};

/// Failure of a single attempt against one backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend answered with status {0}")]
    Status(u16),

    #[error("i/o error: {0}")]
    Io(String),
}

impl UpstreamError {
    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Connect(_) => "connect",
            UpstreamError::Timeout(_) => "timeout",
            UpstreamError::Status(_) => "status",
            UpstreamError::Io(_) => "io",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }
}

/// Why a request could not be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no available backend")]
    NoAvailableBackend,

    #[error("upstream unavailable after {attempts} attempt(s): {last}")]
    UpstreamUnavailable { attempts: u32, last: UpstreamError },
}

impl From<SelectError> for DispatchError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NoAvailableBackend => DispatchError::NoAvailableBackend,
        }
    }
}

/// Forwards one request to one backend.
///
/// Implementations must be cancel-safe: the dispatcher drops the returned
/// future when the attempt budget runs out.
pub trait Upstream: Send + Sync + 'static {
    type Request: Send + Sync;
    type Response: Send;

    fn call(
        &self,
        target: &BackendView,
        request: &Self::Request,
    ) -> impl Future<Output = Result<Self::Response, UpstreamError>> + Send;
}
