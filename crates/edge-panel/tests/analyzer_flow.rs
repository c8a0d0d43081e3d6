//! Anomaly analyzer run over the store: baseline creation, delta
//! detection, and the 24 h dedup window.

use edge_panel::anomaly::AnomalyAnalyzer;
use edge_panel::store::{self, anomalies};
use serde_json::json;

const GIB: i64 = 1 << 30;

async fn seed_user(pool: &sqlx::SqlitePool, email: i64, used_traffic: i64) {
    anomalies::upsert_user_cache(
        pool,
        &[anomalies::UserCacheRow {
            email,
            username: Some(format!("user{}", email)),
            used_traffic_bytes: Some(used_traffic),
            hwid_device_limit: Some(2),
            ..Default::default()
        }],
        store::now_naive(),
    )
    .await
    .unwrap();
}

async fn enable_analyzer(pool: &sqlx::SqlitePool) {
    let settings = anomalies::AnalyzerSettings {
        enabled: true,
        traffic_limit_gb: 100.0,
        check_hwid_anomalies: false,
        ..Default::default()
    };
    anomalies::save_analyzer_settings(pool, &settings).await.unwrap();
}

#[tokio::test]
async fn first_run_baselines_second_run_detects() {
    let pool = store::open_in_memory().await.unwrap();
    enable_analyzer(&pool).await;
    seed_user(&pool, 42, 10 * GIB).await;

    let analyzer = AnomalyAnalyzer::new(pool.clone());

    // First pass: baseline only, no anomaly possible.
    let result = analyzer.run_analysis().await;
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["analyzed_users"], json!(1));
    assert_eq!(result["anomalies_found"], json!(0));

    // User burns through 200 GiB before the next pass.
    seed_user(&pool, 42, 210 * GIB).await;
    let result = analyzer.run_analysis().await;
    assert_eq!(result["anomalies_found"], json!(1));

    let log = anomalies::list_anomalies(&pool, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].anomaly_type, "traffic");
    assert_eq!(log[0].severity, "critical");
    assert_eq!(log[0].user_email, 42);
    assert!(!log[0].notified, "no telegram configured");

    let details: serde_json::Value = serde_json::from_str(log[0].details.as_deref().unwrap()).unwrap();
    assert_eq!(details["consumed_gb"], json!(200.0));
    assert_eq!(details["exceeded_by_gb"], json!(100.0));
}

#[tokio::test]
async fn repeated_anomaly_is_suppressed_within_24h() {
    let pool = store::open_in_memory().await.unwrap();
    enable_analyzer(&pool).await;
    seed_user(&pool, 7, 0).await;

    let analyzer = AnomalyAnalyzer::new(pool.clone());
    analyzer.run_analysis().await;

    seed_user(&pool, 7, 300 * GIB).await;
    analyzer.run_analysis().await;
    assert_eq!(anomalies::list_anomalies(&pool, 10).await.unwrap().len(), 1);

    // Still over the limit on the next pass: suppressed by the
    // unresolved entry.
    seed_user(&pool, 7, 600 * GIB).await;
    analyzer.run_analysis().await;
    assert_eq!(anomalies::list_anomalies(&pool, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn ignored_users_are_skipped() {
    let pool = store::open_in_memory().await.unwrap();
    enable_analyzer(&pool).await;
    seed_user(&pool, 7, 0).await;

    let mut remnawave = edge_panel::store::settings::remnawave_settings(&pool)
        .await
        .unwrap();
    remnawave.ignored_user_ids = Some("[7]".into());
    edge_panel::store::settings::save_remnawave_settings(&pool, &remnawave)
        .await
        .unwrap();

    let analyzer = AnomalyAnalyzer::new(pool.clone());
    let result = analyzer.run_analysis().await;
    assert_eq!(result["analyzed_users"], json!(0));
}

#[tokio::test]
async fn disabled_analyzer_refuses_to_run() {
    let pool = store::open_in_memory().await.unwrap();
    let analyzer = AnomalyAnalyzer::new(pool.clone());
    let result = analyzer.run_analysis().await;
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["error"], json!("Analyzer is disabled"));
}
