//! Administrative HTTP API.
//!
//! # Routes
//! ```text
//! GET    /admin/status
//! GET    /admin/backends
//! POST   /admin/backends               {"host", "port", "weight"?}
//! DELETE /admin/backends/{id}
//! POST   /admin/backends/{id}/drain
//! POST   /admin/backends/{id}/undrain
//! POST   /admin/health-check
//! GET    /admin/strategy
//! PUT    /admin/strategy               {"strategy"}
//! GET    /admin/metrics
//! ```
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::balancer::Balancer;

#[derive(Clone)]
pub struct AdminState {
    pub balancer: Balancer,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(balancer: Balancer, api_key: &str) -> Self {
        Self {
            balancer,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(get_backends).post(add_backend))
        .route("/admin/backends/{id}", delete(remove_backend))
        .route("/admin/backends/{id}/drain", post(drain_backend))
        .route("/admin/backends/{id}/undrain", post(undrain_backend))
        .route("/admin/health-check", post(force_health_check))
        .route("/admin/strategy", get(get_strategy).put(set_strategy))
        .route("/admin/metrics", get(get_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve(
    state: AdminState,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
