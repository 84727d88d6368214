//! HTTP forwarding to backends.
//!
//! Requests and responses are buffered so a failed attempt can be replayed
//! against another backend and the in-flight slot is freed as soon as the
//! backend has answered.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::net::IpAddr;

use crate::dispatch::{Upstream, UpstreamError};
use crate::load_balancer::backend::BackendView;

/// Headers that describe a single hop and are never forwarded.
static HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// A fully buffered inbound request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>, mut headers: HeaderMap, body: Bytes) -> Self {
        strip_hop_by_hop(&mut headers);
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers,
            body,
        }
    }

    /// Append the client address to `x-forwarded-for`.
    pub fn forwarded_for(mut self, client: IpAddr) -> Self {
        let value = match self.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, client),
            None => client.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            self.headers.insert("x-forwarded-for", value);
        }
        self
    }
}

/// A fully buffered backend response.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client<HttpConnector, Body>,
    max_body_bytes: usize,
}

impl HttpUpstream {
    pub fn new(max_body_bytes: usize) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            max_body_bytes,
        }
    }
}

impl Upstream for HttpUpstream {
    type Request = ProxyRequest;
    type Response = ProxyResponse;

    async fn call(&self, target: &BackendView, request: &ProxyRequest) -> Result<ProxyResponse, UpstreamError> {
        let uri = format!("http://{}:{}{}", target.host, target.port, request.path_and_query);
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(uri)
            .version(Version::HTTP_11);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let outbound = builder
            .body(Body::from(request.body.clone()))
            .map_err(|e| UpstreamError::Io(e.to_string()))?;

        let response = self.client.request(outbound).await.map_err(|e| {
            if e.is_connect() {
                UpstreamError::Connect(e.to_string())
            } else {
                UpstreamError::Io(e.to_string())
            }
        })?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(Body::new(body), self.max_body_bytes)
            .await
            .map_err(|e| UpstreamError::Io(e.to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
