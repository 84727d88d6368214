//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, proxy handler)
//!     → request.rs (request ID)
//!     → Dispatcher (picks a backend, retries)
//!     → upstream.rs (forward over hyper client, buffer response)
//!     → Send to client
//! ```

pub mod request;
pub mod server;
pub mod upstream;

pub use request::{request_id, MakeRequestUuid, X_REQUEST_ID};
pub use server::{HttpServer, X_LB_BACKEND};
pub use upstream::{HttpUpstream, ProxyRequest, ProxyResponse};
