//! Blocklist effective-set law and node sync end-to-end.

use edge_panel::blocklist::BlocklistSync;
use edge_panel::store::{self, blocklist, servers};
use edge_types::Direction;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
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

async fn add_rule(pool: &sqlx::SqlitePool, ip: &str, server_id: Option<i64>, direction: Direction) {
    blocklist::create_rule(
        pool,
        &blocklist::RuleCreate {
            ip_cidr: ip.into(),
            server_id,
            direction,
            comment: None,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn effective_set_is_dedup_of_global_server_and_sources() {
    let lists = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("# external list\n5.5.5.5\n1.1.1.1\n6.6.6.0/24\n"),
        )
        .mount(&lists)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, "http://unused").await;

    add_rule(&pool, "1.1.1.1", None, Direction::In).await;
    add_rule(&pool, "2.2.2.2/32", None, Direction::In).await;
    add_rule(&pool, "3.3.3.3", Some(server_id), Direction::In).await;
    // Different direction stays out of the "in" set.
    add_rule(&pool, "9.9.9.9", None, Direction::Out).await;

    blocklist::create_source(
        &pool,
        &blocklist::SourceCreate {
            name: "ext".into(),
            url: format!("{}/list.txt", lists.uri()),
            direction: Direction::In,
        },
    )
    .await
    .unwrap();

    let sync = BlocklistSync::new(pool.clone()).unwrap();
    let mut effective = sync.effective_ips(server_id, Direction::In).await.unwrap();
    effective.sort();

    // 1.1.1.1 appears in both a manual rule and the source, once here.
    assert_eq!(
        effective,
        vec!["1.1.1.1", "2.2.2.2", "3.3.3.3", "5.5.5.5", "6.6.6.0/24"]
    );

    let out = sync.effective_ips(server_id, Direction::Out).await.unwrap();
    assert_eq!(out, vec!["9.9.9.9"]);
}

#[tokio::test]
async fn sync_pushes_both_directions_to_node() {
    let node = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ipset/sync"))
        .and(body_partial_json(json!({"direction": "in", "permanent": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "added": 2, "removed": 0, "invalid": [], "total": 2,
            "message": "Synced"
        })))
        .expect(1)
        .mount(&node)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ipset/sync"))
        .and(body_partial_json(json!({"direction": "out"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "added": 0, "removed": 1, "invalid": [], "total": 0,
            "message": "Synced"
        })))
        .expect(1)
        .mount(&node)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, &node.uri()).await;
    add_rule(&pool, "1.1.1.1", None, Direction::In).await;
    add_rule(&pool, "2.2.2.2", Some(server_id), Direction::In).await;

    let sync = BlocklistSync::new(pool.clone()).unwrap();
    let result = sync.sync_single_node(server_id).await.unwrap();

    assert_eq!(result["success"], json!(true));
    assert_eq!(result["in"]["added"], json!(2));
    assert_eq!(result["in"]["ip_count"], json!(2));
    assert_eq!(result["out"]["removed"], json!(1));

    let status = sync.sync_status().await;
    assert_eq!(status["in_progress"], json!(false));
    assert!(status["servers"][server_id.to_string()]["success"] == json!(true));
}

#[tokio::test]
async fn unreachable_node_fails_without_poisoning_status() {
    let pool = store::open_in_memory().await.unwrap();
    let server_id = seed_server(&pool, "http://127.0.0.1:1").await;
    add_rule(&pool, "1.1.1.1", None, Direction::In).await;

    let sync = BlocklistSync::new(pool.clone()).unwrap();
    let result = sync.sync_single_node(server_id).await.unwrap();
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["in"]["success"], json!(false));

    // The tracker is released for the next attempt.
    let status = sync.sync_status().await;
    assert_eq!(status["in_progress"], json!(false));
}

#[tokio::test]
async fn source_refresh_reports_hash_changes() {
    let lists = MockServer::start().await;
    let first = Mock::given(method("GET"))
        .and(path("/list.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1\n"))
        .up_to_n_times(1)
        .mount_as_scoped(&lists)
        .await;

    let pool = store::open_in_memory().await.unwrap();
    let source_id = blocklist::create_source(
        &pool,
        &blocklist::SourceCreate {
            name: "ext".into(),
            url: format!("{}/list.txt", lists.uri()),
            direction: Direction::In,
        },
    )
    .await
    .unwrap();

    let sync = BlocklistSync::new(pool.clone()).unwrap();
    let source = blocklist::get_source(&pool, source_id).await.unwrap();
    let (success, _, count, changed) = sync.refresh_source(&source).await;
    assert!(success);
    assert_eq!(count, 1);
    assert!(changed, "first refresh always counts as changed");
    drop(first);

    // Same content again: the recorded hash matches, nothing changed.
    Mock::given(method("GET"))
        .and(path("/list.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1\n"))
        .mount(&lists)
        .await;
    let source = blocklist::get_source(&pool, source_id).await.unwrap();
    let (success, _, _, changed) = sync.refresh_source(&source).await;
    assert!(success);
    assert!(!changed);

    let source = blocklist::get_source(&pool, source_id).await.unwrap();
    assert_eq!(source.ip_count, 1);
    assert!(source.last_hash.is_some());
    assert!(source.last_updated.is_some());
}
