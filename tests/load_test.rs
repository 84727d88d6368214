//! Load testing for the balancer.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

mod common;

#[tokio::test]
async fn round_robin_spreads_concurrent_load_evenly() {
    let mut backends = Vec::new();
    for name in ["b1", "b2", "b3"] {
        backends.push(common::backend(common::start_mock_backend(name).await));
    }
    let lb = common::spawn_balancer(common::test_config(backends)).await;

    let tasks = 20;
    let per_task = 25;
    let (tx, mut rx) = mpsc::channel(tasks * per_task);
    let start = Instant::now();

    for _ in 0..tasks {
        let tx = tx.clone();
        let url = format!("http://{}/", lb.addr);
        tokio::spawn(async move {
            let client = common::client();
            for _ in 0..per_task {
                let outcome = match client.get(&url).send().await {
                    Ok(res) => {
                        let backend = res
                            .headers()
                            .get("x-lb-backend")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        (res.status().as_u16(), backend)
                    }
                    Err(_) => (0, None),
                };
                let _ = tx.send(outcome).await;
            }
        });
    }
    drop(tx);

    let mut per_backend: HashMap<String, usize> = HashMap::new();
    let mut ok = 0;
    while let Some((status, backend)) = rx.recv().await {
        if status == 200 {
            ok += 1;
        }
        if let Some(backend) = backend {
            *per_backend.entry(backend).or_insert(0) += 1;
        }
    }
    let elapsed = start.elapsed();
    println!("{} requests in {:?}", tasks * per_task, elapsed);

    assert_eq!(ok, tasks * per_task);
    assert_eq!(per_backend.len(), 3);
    for (backend, count) in &per_backend {
        assert!((166..=167).contains(count), "{} served {}", backend, count);
    }
    assert!(elapsed < Duration::from_secs(30));
    assert_eq!(lb.balancer.registry().snapshot().total_in_flight(), 0);

    lb.shutdown.trigger();
}
