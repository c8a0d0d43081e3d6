//! Xray aggregation end-to-end: node pull, fact-table merge, summaries.

use edge_panel::store::{self, servers, settings, xray};
use edge_panel::xray_aggregator::XrayAggregator;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn seed_node(pool: &sqlx::SqlitePool, url: &str) -> i64 {
    let server_id = servers::create(
        pool,
        &servers::ServerCreate {
            name: "xray-1".into(),
            url: url.into(),
            api_key: "node-key".into(),
            folder: None,
        },
    )
    .await
    .unwrap();
    settings::ensure_node(pool, server_id, true).await.unwrap();
    server_id
}

fn collect_body(stats: serde_json::Value) -> serde_json::Value {
    json!({
        "collected_at": "2026-01-01T10:00:00Z",
        "period_start": "2026-01-01T09:55:00Z",
        "entries_count": 3,
        "stats": stats,
    })
}

#[tokio::test]
async fn collection_merges_into_fact_table_and_rebuilds_summaries() {
    let node = MockServer::start().await;
    // The seed scenario: three visits for user 42 from one IP.
    Mock::given(method("POST"))
        .and(path("/api/remnawave/stats/collect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collect_body(json!([
            {"email": 42, "source_ip": "9.9.9.9", "host": "a.com", "count": 2},
            {"email": 42, "source_ip": "9.9.9.9", "host": "b.com", "count": 1},
        ]))))
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    seed_node(&pool, &node.uri()).await;
    let aggregator = XrayAggregator::new(pool.clone()).unwrap();

    let collected = aggregator.collect_from_all_nodes().await.unwrap();
    assert_eq!(collected, 1);
    aggregator.rebuild_summaries().await.unwrap();

    let (count_a,): (i64,) = sqlx::query_as(
        "SELECT count FROM xray_stats WHERE email = 42 AND source_ip = '9.9.9.9' AND host = 'a.com'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count_a, 2);

    let destinations = xray::top_destinations(&pool, 10).await.unwrap();
    assert_eq!(destinations[0].host, "a.com");
    assert_eq!(destinations[0].total_visits, 2);

    let user = xray::user_summary(&pool, 42).await.unwrap().unwrap();
    assert_eq!(user.unique_sites, 2);
    assert_eq!(user.total_visits, 3);

    // The fleet-wide hourly row carries this cycle's totals.
    let hourly = xray::hourly_stats(&pool, store::now_naive() - chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].server_id, 0);
    assert_eq!(hourly[0].visit_count, 3);
    assert_eq!(hourly[0].unique_users, 1);
    assert_eq!(hourly[0].unique_destinations, 2);

    // Node status shows a successful collection.
    let nodes = settings::enabled_nodes(&pool).await.unwrap();
    assert!(nodes[0].0.last_collected.is_some());
    assert!(nodes[0].0.last_error.is_none());
}

#[tokio::test]
async fn repeated_collections_keep_counts_monotonic() {
    let node = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/remnawave/stats/collect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collect_body(json!([
            {"email": 1, "source_ip": "1.1.1.1", "host": "x.com", "count": 5},
        ]))))
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    seed_node(&pool, &node.uri()).await;
    let aggregator = XrayAggregator::new(pool.clone()).unwrap();

    aggregator.collect_from_all_nodes().await.unwrap();
    aggregator.collect_from_all_nodes().await.unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT count FROM xray_stats WHERE email = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 10);
}

#[tokio::test]
async fn ignored_users_and_excluded_hosts_are_dropped() {
    let node = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/remnawave/stats/collect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collect_body(json!([
            {"email": 1, "source_ip": "1.1.1.1", "host": "keep.com", "count": 1},
            {"email": 99, "source_ip": "1.1.1.1", "host": "keep.com", "count": 1},
            {"email": 1, "source_ip": "1.1.1.1", "host": "excluded.com:443", "count": 1},
        ]))))
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    seed_node(&pool, &node.uri()).await;

    let mut remnawave = settings::remnawave_settings(&pool).await.unwrap();
    remnawave.ignored_user_ids = Some("[99]".into());
    settings::save_remnawave_settings(&pool, &remnawave).await.unwrap();
    sqlx::query("INSERT INTO remnawave_excluded_destinations (destination) VALUES ('excluded.com')")
        .execute(&pool)
        .await
        .unwrap();

    let aggregator = XrayAggregator::new(pool.clone()).unwrap();
    aggregator.collect_from_all_nodes().await.unwrap();

    let rows: Vec<(i64, String)> = sqlx::query_as("SELECT email, host FROM xray_stats")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows, vec![(1, "keep.com".to_string())]);
}

#[tokio::test]
async fn node_failure_records_error() {
    let node = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/remnawave/stats/collect"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    seed_node(&pool, &node.uri()).await;
    let aggregator = XrayAggregator::new(pool.clone()).unwrap();
    aggregator.collect_from_all_nodes().await.unwrap();

    let nodes = settings::enabled_nodes(&pool).await.unwrap();
    assert!(nodes[0].0.last_error.as_deref().unwrap().contains("HTTP 500"));
}
