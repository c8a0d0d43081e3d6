//! Fleet collector end-to-end against a mocked node.

use edge_panel::collector::FleetCollector;
use edge_panel::store::{self, metrics, servers};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn seed_server(pool: &sqlx::SqlitePool, url: &str) -> i64 {
    servers::create(
        pool,
        &servers::ServerCreate {
            name: "edge-1".into(),
            url: url.into(),
            api_key: "node-key".into(),
            folder: None,
        },
    )
    .await
    .unwrap()
}

fn metrics_body(rx_bytes: u64, cpu: f64) -> serde_json::Value {
    json!({
        "timestamp": "2026-01-01T00:00:00",
        "server_name": "edge-1",
        "cpu": {"usage_percent": cpu, "load_avg_1": 0.5},
        "memory": {"ram": {"total": 1000, "used": 400, "available": 600, "percent": 40.0},
                    "swap": {"total": 0, "used": 0, "free": 0, "percent": 0.0}},
        "disk": {"partitions": [{"device": "sda1", "mountpoint": "/", "percent": 33.0}], "io": {}},
        "network": {"interfaces": [], "total": {"rx_bytes": rx_bytes, "tx_bytes": 0}},
        "processes": {"total": 100},
        "system": {
            "connections": {"established": 5, "listen": 3},
            "connections_detailed": {"tcp": {"established": 5, "listen": 3, "time_wait": 1}, "udp": {"total": 2}}
        },
        "certificates": {"count": 0}
    })
}

#[tokio::test]
async fn successful_poll_stores_snapshot_and_marks_online() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/metrics"))
        .and(header("X-API-Key", "node-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metrics_body(1_000_000, 42.0)))
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, &node.uri()).await;
    let collector = FleetCollector::new(pool.clone()).unwrap();

    let server = servers::get(&pool, server_id).await.unwrap();
    collector.collect_server(&server).await.unwrap();

    let server = servers::get(&pool, server_id).await.unwrap();
    assert!(server.last_seen.is_some());
    assert!(server.last_error.is_none());
    assert!(server.last_metrics.is_some());

    let since = store::now_naive() - chrono::Duration::hours(1);
    let history = metrics::history(&pool, server_id, since).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].cpu_usage, Some(42.0));
    // First poll only establishes the speed baseline.
    assert_eq!(history[0].net_rx_bytes_per_sec, 0.0);
    assert_eq!(history[0].tcp_established, Some(5));
}

#[tokio::test]
async fn second_poll_derives_speed() {
    let node = MockServer::start().await;
    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, &node.uri()).await;
    let collector = FleetCollector::new(pool.clone()).unwrap();
    let server = servers::get(&pool, server_id).await.unwrap();

    let first = Mock::given(method("GET"))
        .and(path("/api/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metrics_body(1_000_000, 10.0)))
        .up_to_n_times(1)
        .mount_as_scoped(&node)
        .await;
    collector.collect_server(&server).await.unwrap();
    drop(first);

    // Enough wall-clock distance for the rate rule's 0.5 s floor.
    tokio::time::sleep(std::time::Duration::from_millis(700)).await;

    Mock::given(method("GET"))
        .and(path("/api/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metrics_body(1_070_000, 10.0)))
        .mount(&node)
        .await;
    collector.collect_server(&server).await.unwrap();

    let since = store::now_naive() - chrono::Duration::hours(1);
    let history = metrics::history(&pool, server_id, since).await.unwrap();
    assert_eq!(history.len(), 2);
    let speed = history[1].net_rx_bytes_per_sec;
    // 70 KB over ~0.7 s: the exact dt floats, but the speed must be
    // positive and in the right order of magnitude.
    assert!(speed > 10_000.0, "speed was {}", speed);
    assert!(speed < 1_000_000.0, "speed was {}", speed);
}

#[tokio::test]
async fn auth_failure_is_classified_without_snapshot() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/metrics"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, &node.uri()).await;
    let collector = FleetCollector::new(pool.clone()).unwrap();
    let server = servers::get(&pool, server_id).await.unwrap();
    collector.collect_server(&server).await.unwrap();

    let server = servers::get(&pool, server_id).await.unwrap();
    assert_eq!(server.error_code, Some(401));
    assert_eq!(server.last_error.as_deref(), Some("Authentication failed"));
    assert!(server.last_seen.is_none());

    let since = store::now_naive() - chrono::Duration::hours(1);
    assert!(metrics::history(&pool, server_id, since)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn server_error_is_classified_with_status() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/metrics"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, &node.uri()).await;
    let collector = FleetCollector::new(pool.clone()).unwrap();
    let server = servers::get(&pool, server_id).await.unwrap();
    collector.collect_server(&server).await.unwrap();

    let server = servers::get(&pool, server_id).await.unwrap();
    assert_eq!(server.error_code, Some(503));
    assert!(server.last_error.unwrap().contains("Server error"));
}

#[tokio::test]
async fn cache_loop_stores_haproxy_and_traffic_blobs() {
    let node = MockServer::start().await;
    for (endpoint, body) in [
        ("/api/haproxy/status", json!({"running": true})),
        ("/api/haproxy/rules", json!({"rules": [], "count": 0})),
        ("/api/haproxy/certs/all", json!({"certificates": [], "count": 0})),
        ("/api/haproxy/firewall/rules", json!({"rules": [], "count": 0})),
        ("/api/traffic/summary", json!({"rx_bytes": 5, "tx_bytes": 6, "days": 30})),
        ("/api/traffic/ports/tracked", json!({"ports": [443]})),
    ] {
        Mock::given(method("GET"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&node)
            .await;
    }

    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, &node.uri()).await;
    let collector = FleetCollector::new(pool.clone()).unwrap();
    let server = servers::get(&pool, server_id).await.unwrap();

    collector.cache_server_data(&server).await;

    let server = servers::get(&pool, server_id).await.unwrap();
    let haproxy: serde_json::Value =
        serde_json::from_str(server.last_haproxy_data.as_deref().unwrap()).unwrap();
    assert_eq!(haproxy["status"]["running"], json!(true));
    assert!(haproxy["cached_at"].is_string());

    let traffic: serde_json::Value =
        serde_json::from_str(server.last_traffic_data.as_deref().unwrap()).unwrap();
    assert_eq!(traffic["tracked_ports"]["ports"], json!([443]));
}
