//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (session ID, live-session count)
//!     → tcp_proxy.rs (dispatch, then relay bytes both ways)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each session tracked for graceful shutdown
//! - HTTP mode hands the socket to axum instead

pub mod connection;
pub mod listener;
pub mod tcp_proxy;

pub use connection::{SessionGuard, SessionId, SessionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use tcp_proxy::{TcpProxy, TcpUpstream};
