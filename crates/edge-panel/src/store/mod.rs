//! Relational store for the panel.
//!
//! SQLite through sqlx. All datetimes are naive UTC; the HTTP layer
//! serializes them as ISO-8601 with a trailing `Z`. Schema setup is an
//! idempotent sequence of CREATE IF NOT EXISTS statements; summary
//! tables are always derivable by a full scan of `xray_stats`.

pub mod alerts;
pub mod anomalies;
pub mod blocklist;
pub mod metrics;
pub mod servers;
pub mod settings;
pub mod xray;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

pub async fn open(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

pub async fn open_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            api_key TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            folder TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT,
            last_seen TEXT,
            last_error TEXT,
            error_code INTEGER,
            last_metrics TEXT,
            last_haproxy_data TEXT,
            last_traffic_data TEXT,
            has_xray_node INTEGER NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE IF NOT EXISTS metrics_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
            timestamp TEXT NOT NULL,
            cpu_usage REAL,
            load_avg_1 REAL,
            load_avg_5 REAL,
            load_avg_15 REAL,
            memory_total INTEGER,
            memory_used INTEGER,
            memory_available INTEGER,
            memory_percent REAL,
            swap_used INTEGER,
            swap_percent REAL,
            net_rx_bytes_per_sec REAL NOT NULL DEFAULT 0,
            net_tx_bytes_per_sec REAL NOT NULL DEFAULT 0,
            net_rx_bytes INTEGER,
            net_tx_bytes INTEGER,
            disk_percent REAL,
            disk_read_bytes_per_sec REAL NOT NULL DEFAULT 0,
            disk_write_bytes_per_sec REAL NOT NULL DEFAULT 0,
            process_count INTEGER,
            connections_count INTEGER,
            tcp_established INTEGER,
            tcp_listen INTEGER,
            tcp_time_wait INTEGER,
            tcp_close_wait INTEGER,
            tcp_syn_sent INTEGER,
            tcp_syn_recv INTEGER,
            tcp_fin_wait INTEGER,
            per_cpu_percent TEXT
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_metrics_server_time ON metrics_snapshots(server_id, timestamp)",
        r#"CREATE TABLE IF NOT EXISTS aggregated_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
            timestamp TEXT NOT NULL,
            period_type TEXT NOT NULL,
            avg_cpu REAL,
            max_cpu REAL,
            avg_load REAL,
            avg_memory_percent REAL,
            max_memory_percent REAL,
            avg_disk_percent REAL,
            total_rx_bytes INTEGER NOT NULL DEFAULT 0,
            total_tx_bytes INTEGER NOT NULL DEFAULT 0,
            avg_rx_speed REAL NOT NULL DEFAULT 0,
            avg_tx_speed REAL NOT NULL DEFAULT 0,
            avg_disk_read_speed REAL NOT NULL DEFAULT 0,
            avg_disk_write_speed REAL NOT NULL DEFAULT 0,
            avg_tcp_established REAL,
            avg_tcp_listen REAL,
            avg_tcp_time_wait REAL,
            avg_tcp_close_wait REAL,
            avg_tcp_syn_sent REAL,
            avg_tcp_syn_recv REAL,
            avg_tcp_fin_wait REAL,
            data_points INTEGER NOT NULL DEFAULT 0,
            UNIQUE(server_id, period_type, timestamp)
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_aggregated_server_period ON aggregated_metrics(server_id, period_type, timestamp)",
        r#"CREATE TABLE IF NOT EXISTS panel_settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL UNIQUE,
            value TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS blocklist_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip_cidr TEXT NOT NULL,
            server_id INTEGER REFERENCES servers(id) ON DELETE CASCADE,
            is_permanent INTEGER NOT NULL DEFAULT 1,
            direction TEXT NOT NULL DEFAULT 'in',
            comment TEXT,
            source TEXT NOT NULL DEFAULT 'manual',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_blocklist_server ON blocklist_rules(server_id)",
        "CREATE INDEX IF NOT EXISTS idx_blocklist_source ON blocklist_rules(source)",
        "CREATE INDEX IF NOT EXISTS idx_blocklist_direction ON blocklist_rules(direction)",
        r#"CREATE TABLE IF NOT EXISTS blocklist_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            url TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            is_default INTEGER NOT NULL DEFAULT 0,
            direction TEXT NOT NULL DEFAULT 'in',
            last_updated TEXT,
            last_hash TEXT,
            ip_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        // The single dimensional fact table: the only place per-visit
        // data lives.
        r#"CREATE TABLE IF NOT EXISTS xray_stats (
            email INTEGER NOT NULL,
            source_ip TEXT NOT NULL,
            host TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            first_seen TEXT NOT NULL DEFAULT (datetime('now')),
            last_seen TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (email, source_ip, host)
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_xray_stats_host ON xray_stats(host)",
        "CREATE INDEX IF NOT EXISTS idx_xray_stats_last_seen ON xray_stats(last_seen)",
        "CREATE INDEX IF NOT EXISTS idx_xray_stats_email_last_seen ON xray_stats(email, last_seen)",
        // server_id = 0 is the fleet-wide aggregate row.
        r#"CREATE TABLE IF NOT EXISTS xray_hourly_stats (
            server_id INTEGER NOT NULL,
            hour TEXT NOT NULL,
            visit_count INTEGER NOT NULL DEFAULT 0,
            unique_users INTEGER NOT NULL DEFAULT 0,
            unique_destinations INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (server_id, hour)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS xray_global_summary (
            id INTEGER PRIMARY KEY,
            total_visits INTEGER NOT NULL DEFAULT 0,
            unique_users INTEGER NOT NULL DEFAULT 0,
            unique_destinations INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS xray_destination_summary (
            host TEXT PRIMARY KEY,
            total_visits INTEGER NOT NULL DEFAULT 0,
            unique_users INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS xray_user_summary (
            email INTEGER PRIMARY KEY,
            total_visits INTEGER NOT NULL DEFAULT 0,
            unique_sites INTEGER NOT NULL DEFAULT 0,
            unique_client_ips INTEGER NOT NULL DEFAULT 0,
            infrastructure_ips INTEGER NOT NULL DEFAULT 0,
            first_seen TEXT,
            last_seen TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS remnawave_settings (
            id INTEGER PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 0,
            api_url TEXT,
            api_token TEXT,
            cookie_secret TEXT,
            collection_interval INTEGER NOT NULL DEFAULT 300,
            ignored_user_ids TEXT,
            visit_stats_retention_days INTEGER NOT NULL DEFAULT 365,
            hourly_stats_retention_days INTEGER NOT NULL DEFAULT 365
        )"#,
        r#"CREATE TABLE IF NOT EXISTS remnawave_nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL UNIQUE REFERENCES servers(id) ON DELETE CASCADE,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_collected TEXT,
            last_error TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS remnawave_user_cache (
            email INTEGER PRIMARY KEY,
            uuid TEXT,
            short_uuid TEXT,
            username TEXT,
            telegram_id TEXT,
            status TEXT,
            expire_at TEXT,
            subscription_url TEXT,
            sub_last_user_agent TEXT,
            sub_last_opened_at TEXT,
            traffic_limit_bytes INTEGER,
            traffic_limit_strategy TEXT,
            last_traffic_reset_at TEXT,
            used_traffic_bytes INTEGER,
            lifetime_used_traffic_bytes INTEGER,
            online_at TEXT,
            first_connected_at TEXT,
            hwid_device_limit INTEGER,
            user_email TEXT,
            description TEXT,
            tag TEXT,
            created_at TEXT,
            updated_at TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS remnawave_infrastructure_addresses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL UNIQUE,
            resolved_ips TEXT,
            last_resolved TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS remnawave_excluded_destinations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            destination TEXT NOT NULL UNIQUE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS asn_cache (
            ip TEXT PRIMARY KEY,
            asn TEXT,
            prefix TEXT,
            cached_at TEXT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS user_traffic_snapshots (
            user_email INTEGER PRIMARY KEY,
            traffic_bytes INTEGER NOT NULL DEFAULT 0,
            snapshot_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        r#"CREATE TABLE IF NOT EXISTS traffic_anomaly_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_email INTEGER NOT NULL,
            username TEXT,
            anomaly_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            details TEXT,
            notified INTEGER NOT NULL DEFAULT 0,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_anomaly_user_type ON traffic_anomaly_log(user_email, anomaly_type, created_at)",
        r#"CREATE TABLE IF NOT EXISTS traffic_analyzer_settings (
            id INTEGER PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 0,
            check_interval_minutes INTEGER NOT NULL DEFAULT 30,
            traffic_limit_gb REAL NOT NULL DEFAULT 100,
            ip_limit_multiplier REAL NOT NULL DEFAULT 2,
            check_hwid_anomalies INTEGER NOT NULL DEFAULT 1,
            telegram_bot_token TEXT,
            telegram_chat_id TEXT,
            last_check_at TEXT,
            last_error TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS alert_settings (
            id INTEGER PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 0,
            check_interval INTEGER NOT NULL DEFAULT 60,
            alert_cooldown INTEGER NOT NULL DEFAULT 1800,
            language TEXT NOT NULL DEFAULT 'en',
            telegram_bot_token TEXT,
            telegram_chat_id TEXT,
            excluded_server_ids TEXT,
            offline_enabled INTEGER NOT NULL DEFAULT 1,
            offline_fail_threshold INTEGER NOT NULL DEFAULT 3,
            offline_recovery_notify INTEGER NOT NULL DEFAULT 1,
            cpu_enabled INTEGER NOT NULL DEFAULT 1,
            cpu_critical_threshold REAL NOT NULL DEFAULT 90,
            cpu_spike_percent REAL NOT NULL DEFAULT 200,
            cpu_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            cpu_min_value REAL NOT NULL DEFAULT 0,
            ram_enabled INTEGER NOT NULL DEFAULT 1,
            ram_critical_threshold REAL NOT NULL DEFAULT 90,
            ram_spike_percent REAL NOT NULL DEFAULT 200,
            ram_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            ram_min_value REAL NOT NULL DEFAULT 0,
            network_enabled INTEGER NOT NULL DEFAULT 1,
            network_spike_percent REAL NOT NULL DEFAULT 300,
            network_drop_percent REAL NOT NULL DEFAULT 80,
            network_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            network_min_bytes REAL NOT NULL DEFAULT 0,
            tcp_min_connections REAL NOT NULL DEFAULT 0,
            tcp_established_enabled INTEGER NOT NULL DEFAULT 0,
            tcp_established_spike_percent REAL NOT NULL DEFAULT 200,
            tcp_established_drop_percent REAL NOT NULL DEFAULT 80,
            tcp_established_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            tcp_listen_enabled INTEGER NOT NULL DEFAULT 0,
            tcp_listen_spike_percent REAL NOT NULL DEFAULT 200,
            tcp_listen_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            tcp_timewait_enabled INTEGER NOT NULL DEFAULT 0,
            tcp_timewait_spike_percent REAL NOT NULL DEFAULT 200,
            tcp_timewait_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            tcp_closewait_enabled INTEGER NOT NULL DEFAULT 0,
            tcp_closewait_spike_percent REAL NOT NULL DEFAULT 200,
            tcp_closewait_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            tcp_synsent_enabled INTEGER NOT NULL DEFAULT 0,
            tcp_synsent_spike_percent REAL NOT NULL DEFAULT 200,
            tcp_synsent_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            tcp_synrecv_enabled INTEGER NOT NULL DEFAULT 0,
            tcp_synrecv_spike_percent REAL NOT NULL DEFAULT 200,
            tcp_synrecv_sustained_seconds INTEGER NOT NULL DEFAULT 300,
            tcp_finwait_enabled INTEGER NOT NULL DEFAULT 0,
            tcp_finwait_spike_percent REAL NOT NULL DEFAULT 200,
            tcp_finwait_sustained_seconds INTEGER NOT NULL DEFAULT 300
        )"#,
        r#"CREATE TABLE IF NOT EXISTS alert_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER,
            server_name TEXT,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            details TEXT,
            notified INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

/// Format a naive-UTC datetime the way the store keys its period and
/// timestamp columns.
pub fn now_naive() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();
    }
}
