//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use loadbalancer::config::{BackendConfig, BalancerConfig};
use loadbalancer::lifecycle::{Application, Shutdown};
use loadbalancer::Balancer;

/// Read until the end of the request head so closing the socket never
/// resets a request the client is still sending.
async fn read_request_head(socket: &mut TcpStream) {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    return;
                }
            }
        }
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Start a mock backend that always answers `200` with `response`.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move || async move { (200, response.to_string()) }).await
}

/// Start a mock backend whose status and body come from `f`, once per request.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                read_request_head(&mut socket).await;
                let (status, body) = f().await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line(status),
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Start a TCP server that echoes every byte back.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn backend(addr: SocketAddr) -> BackendConfig {
    BackendConfig::new(addr.ip().to_string(), addr.port())
}

/// Defaults suited to tests: ephemeral port, no exporter, no probing.
pub fn test_config(backends: Vec<BackendConfig>) -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.backends = backends;
    config.observability.metrics_enabled = false;
    config.health_check.enabled = false;
    config.dispatch.base_backoff_ms = 1;
    config.dispatch.max_backoff_ms = 5;
    config
}

pub struct Running {
    pub addr: SocketAddr,
    pub admin_addr: Option<SocketAddr>,
    pub balancer: Balancer,
    pub shutdown: Shutdown,
}

/// Build and start a balancer in the background.
pub async fn spawn_balancer(config: BalancerConfig) -> Running {
    let app = Application::build(config, None).await.unwrap();
    let running = Running {
        addr: app.local_addr(),
        admin_addr: app.admin_addr(),
        balancer: app.balancer().clone(),
        shutdown: app.shutdown(),
    };
    tokio::spawn(async move {
        let _ = app.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    running
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
