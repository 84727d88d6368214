//! HTTP front-end.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all proxy handler
//! - Wire up middleware (request ID, tracing, body limit, concurrency limit)
//! - Buffer the inbound request and hand it to the dispatcher
//! - Map dispatch failures to 502/503/504

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ListenerConfig;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::http::request::{request_id, MakeRequestUuid, X_REQUEST_ID};
use crate::http::upstream::{HttpUpstream, ProxyRequest};
use crate::load_balancer::context::RequestContext;

/// Response header naming the backend that served the request.
pub const X_LB_BACKEND: HeaderName = HeaderName::from_static("x-lb-backend");

#[derive(Clone)]
struct ProxyState {
    dispatcher: Arc<Dispatcher<HttpUpstream>>,
    sticky_header: String,
    max_body_bytes: usize,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::NoAvailableBackend => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::UpstreamUnavailable { last, .. } if last.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(dispatcher: Dispatcher<HttpUpstream>, listener: &ListenerConfig, sticky_header: &str) -> Self {
        let state = ProxyState {
            dispatcher: Arc::new(dispatcher),
            sticky_header: sticky_header.to_ascii_lowercase(),
            max_body_bytes: listener.max_body_bytes,
        };
        let limit = Arc::new(Semaphore::new(listener.max_connections.max(1)));

        let router = Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(middleware::from_fn_with_state(limit, limit_concurrency))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
                    .layer(RequestBodyLimitLayer::new(listener.max_body_bytes)),
            );
        Self { router }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until a shutdown signal arrives, then finish open requests.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server received shutdown signal");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Caps concurrently handled requests at `listener.max_connections`.
async fn limit_concurrency(State(limit): State<Arc<Semaphore>>, request: Request, next: Next) -> Response {
    match limit.acquire_owned().await {
        Ok(_permit) => next.run(request).await,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let request_id = request_id(request.headers()).to_string();
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(request_id = %request_id, error = %e, "Rejected request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let client_key = parts
        .headers
        .get(state.sticky_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| peer.ip().to_string());
    let ctx = RequestContext::new().with_client_key(client_key);

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let forwarded = ProxyRequest::new(parts.method, path_and_query, parts.headers, body).forwarded_for(peer.ip());

    match state.dispatcher.handle(&forwarded, ctx).await {
        Ok(routed) => {
            tracing::debug!(
                request_id = %request_id,
                backend = %routed.backend.id,
                attempts = routed.attempts,
                "Request proxied"
            );
            let backend = HeaderValue::from_str(routed.backend.id.as_str()).ok();
            let (upstream_response, _lease) = routed.into_parts();
            let mut response = upstream_response.into_response();
            if let Some(backend) = backend {
                response.headers_mut().insert(X_LB_BACKEND, backend);
            }
            response
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Request failed");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::UpstreamError;
    use std::time::Duration;

    #[test]
    fn dispatch_errors_map_to_gateway_statuses() {
        assert_eq!(
            DispatchError::NoAvailableBackend.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let timeout = DispatchError::UpstreamUnavailable {
            attempts: 2,
            last: UpstreamError::Timeout(Duration::from_millis(100)),
        };
        assert_eq!(timeout.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
        let refused = DispatchError::UpstreamUnavailable {
            attempts: 2,
            last: UpstreamError::Connect("refused".into()),
        };
        assert_eq!(refused.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
