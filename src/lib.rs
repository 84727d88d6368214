//! Load-balancing request dispatcher.
//!
//! A backend registry, an active health prober, pluggable selection
//! strategies, and a retrying dispatcher with per-backend circuit breakers,
//! served over HTTP or as a TCP passthrough.

pub mod admin;
pub mod balancer;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod resilience;

pub use balancer::Balancer;
pub use config::schema::BalancerConfig;
pub use dispatch::{DispatchError, Dispatcher, Routed, Upstream, UpstreamError};
pub use http::HttpServer;
pub use lifecycle::{Application, Shutdown};
pub use load_balancer::Strategy;
