//! Liveness probes.

use std::future::Future;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpStream;
use tokio::time;

use crate::config::{HealthCheckConfig, ProbeKind};
use crate::health::state::ProbeResult;
use crate::load_balancer::backend::BackendView;

/// A lightweight liveness check against one backend.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, target: &BackendView) -> impl Future<Output = ProbeResult> + Send;
}

/// Healthy when a TCP connection can be opened.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Probe for TcpProbe {
    async fn probe(&self, target: &BackendView) -> ProbeResult {
        let started = Instant::now();
        match time::timeout(self.timeout, TcpStream::connect((target.host.as_str(), target.port))).await {
            Ok(Ok(_stream)) => ProbeResult::success(started.elapsed()),
            Ok(Err(e)) => ProbeResult::failure(started.elapsed(), format!("connect: {}", e)),
            Err(_) => ProbeResult::failure(started.elapsed(), "timeout"),
        }
    }
}

/// Healthy when `GET path` answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Body>,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            path: path.into(),
            timeout,
        }
    }
}

impl Probe for HttpProbe {
    async fn probe(&self, target: &BackendView) -> ProbeResult {
        let started = Instant::now();
        let uri = format!("http://{}:{}{}", target.host, target.port, self.path);
        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "loadbalancer-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => return ProbeResult::failure(started.elapsed(), format!("bad probe request: {}", e)),
        };

        match time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeResult::success(started.elapsed()),
            Ok(Ok(response)) => ProbeResult::failure(started.elapsed(), format!("status {}", response.status())),
            Ok(Err(e)) => ProbeResult::failure(started.elapsed(), format!("connection error: {}", e)),
            Err(_) => ProbeResult::failure(started.elapsed(), "timeout"),
        }
    }
}

/// Probe chosen from configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredProbe {
    Tcp(TcpProbe),
    Http(HttpProbe),
}

impl ConfiguredProbe {
    pub fn from_config(config: &HealthCheckConfig) -> Self {
        match config.kind {
            ProbeKind::Tcp => ConfiguredProbe::Tcp(TcpProbe::new(config.timeout())),
            ProbeKind::Http => ConfiguredProbe::Http(HttpProbe::new(config.path.clone(), config.timeout())),
        }
    }
}

impl Probe for ConfiguredProbe {
    async fn probe(&self, target: &BackendView) -> ProbeResult {
        match self {
            ConfiguredProbe::Tcp(p) => p.probe(target).await,
            ConfiguredProbe::Http(p) => p.probe(target).await,
        }
    }
}
