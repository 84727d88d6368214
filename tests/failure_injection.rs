//! Failure injection tests for the load balancer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use loadbalancer::config::{BackendConfig, FrontendMode};
use loadbalancer::load_balancer::{BackendId, HealthState};
use loadbalancer::Strategy;

mod common;

#[tokio::test]
async fn failed_attempt_is_retried_on_another_backend() {
    let failing_calls = Arc::new(AtomicU32::new(0));
    let fc = failing_calls.clone();
    let failing = common::start_programmable_backend(move || {
        let fc = fc.clone();
        async move {
            fc.fetch_add(1, Ordering::SeqCst);
            (503, "Service Unavailable".into())
        }
    })
    .await;
    let healthy = common::start_mock_backend("healthy").await;

    let mut config = common::test_config(vec![common::backend(failing), common::backend(healthy)]);
    config.circuit_breaker.enabled = false;
    let lb = common::spawn_balancer(config).await;
    let client = common::client();

    for _ in 0..4 {
        let res = client.get(format!("http://{}/", lb.addr)).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "healthy");
    }
    assert!(failing_calls.load(Ordering::SeqCst) >= 1, "the failing backend should have been tried");
    assert_eq!(lb.balancer.registry().snapshot().total_in_flight(), 0);

    lb.shutdown.trigger();
}

#[tokio::test]
async fn exhausted_retries_return_bad_gateway() {
    let a = common::start_programmable_backend(|| async { (502, "down".into()) }).await;
    let b = common::dead_address().await;

    let lb = common::spawn_balancer(common::test_config(vec![common::backend(a), common::backend(b)])).await;
    let res = common::client().get(format!("http://{}/", lb.addr)).send().await.unwrap();
    assert_eq!(res.status(), 502);

    lb.shutdown.trigger();
}

#[tokio::test]
async fn no_backends_return_service_unavailable() {
    let lb = common::spawn_balancer(common::test_config(Vec::new())).await;
    let res = common::client().get(format!("http://{}/", lb.addr)).send().await.unwrap();
    assert_eq!(res.status(), 503);

    lb.shutdown.trigger();
}

#[tokio::test]
async fn health_checks_evict_dead_backend() {
    let alive = common::start_mock_backend("alive").await;
    let dead = common::dead_address().await;

    let mut config = common::test_config(vec![common::backend(alive), common::backend(dead)]);
    config.health_check.enabled = true;
    config.health_check.interval_ms = 50;
    config.health_check.timeout_ms = 50;
    let lb = common::spawn_balancer(config).await;

    let dead_id = BackendId::new(&dead.ip().to_string(), dead.port());
    let mut evicted = false;
    for _ in 0..40 {
        if lb.balancer.registry().get(&dead_id).map(|b| b.health) == Some(HealthState::Unhealthy) {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(evicted, "dead backend should be marked unhealthy after 3 failed probes");

    let client = common::client();
    for _ in 0..4 {
        let res = client.get(format!("http://{}/", lb.addr)).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.headers()["x-lb-backend"], format!("{}", alive));
    }

    lb.shutdown.trigger();
}

#[tokio::test]
async fn admin_api_manages_backends() {
    let first = common::start_mock_backend("first").await;
    let second = common::start_mock_backend("second").await;

    let mut config = common::test_config(vec![common::backend(first)]);
    config.admin.enabled = true;
    config.admin.bind_address = "127.0.0.1:0".into();
    config.admin.api_key = "test-key".into();
    let lb = common::spawn_balancer(config).await;
    let admin = format!("http://{}", lb.admin_addr.unwrap());
    let client = common::client();

    let res = client.get(format!("{}/admin/status", admin)).send().await.unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .post(format!("{}/admin/backends", admin))
        .bearer_auth("test-key")
        .json(&BackendConfig::new("127.0.0.1", second.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    let res = client
        .post(format!("{}/admin/backends", admin))
        .bearer_auth("test-key")
        .json(&BackendConfig::new("127.0.0.1", second.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 409);

    let res = client
        .post(format!("{}/admin/backends/{}/drain", admin, first))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);

    for _ in 0..3 {
        let res = client.get(format!("http://{}/", lb.addr)).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "second");
    }

    let res = client
        .delete(format!("{}/admin/backends/127.0.0.1:1", admin))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    let res = client
        .put(format!("{}/admin/strategy", admin))
        .bearer_auth("test-key")
        .json(&serde_json::json!({ "strategy": "least_connections" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(lb.balancer.strategy(), Strategy::LeastConnections);

    let backends: serde_json::Value = client
        .get(format!("{}/admin/backends", admin))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = backends.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|b| b["health"] == "draining"));

    let metrics: serde_json::Value = client
        .get(format!("{}/admin/metrics", admin))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let served = metrics
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["backend"] == format!("127.0.0.1:{}", second.port()))
        .unwrap();
    assert_eq!(served["requests"], 3);

    lb.shutdown.trigger();
}

#[tokio::test]
async fn tcp_passthrough_relays_and_counts_sessions() {
    let echo = common::start_echo_server().await;
    let mut config = common::test_config(vec![common::backend(echo)]);
    config.listener.mode = FrontendMode::Tcp;
    let lb = common::spawn_balancer(config).await;

    let mut stream = TcpStream::connect(lb.addr).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(lb.balancer.registry().snapshot().total_in_flight(), 1);

    drop(stream);
    let mut released = false;
    for _ in 0..40 {
        if lb.balancer.registry().snapshot().total_in_flight() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(released, "session end should release the backend");

    lb.shutdown.trigger();
}
