//! Alert settings (single row) and the alert audit trail.

use crate::error::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AlertSettings {
    pub enabled: bool,
    pub check_interval: i64,
    pub alert_cooldown: i64,
    pub language: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub excluded_server_ids: Option<String>,
    pub offline_enabled: bool,
    pub offline_fail_threshold: i64,
    pub offline_recovery_notify: bool,
    pub cpu_enabled: bool,
    pub cpu_critical_threshold: f64,
    pub cpu_spike_percent: f64,
    pub cpu_sustained_seconds: i64,
    pub cpu_min_value: f64,
    pub ram_enabled: bool,
    pub ram_critical_threshold: f64,
    pub ram_spike_percent: f64,
    pub ram_sustained_seconds: i64,
    pub ram_min_value: f64,
    pub network_enabled: bool,
    pub network_spike_percent: f64,
    pub network_drop_percent: f64,
    pub network_sustained_seconds: i64,
    pub network_min_bytes: f64,
    pub tcp_min_connections: f64,
    pub tcp_established_enabled: bool,
    pub tcp_established_spike_percent: f64,
    pub tcp_established_drop_percent: f64,
    pub tcp_established_sustained_seconds: i64,
    pub tcp_listen_enabled: bool,
    pub tcp_listen_spike_percent: f64,
    pub tcp_listen_sustained_seconds: i64,
    pub tcp_timewait_enabled: bool,
    pub tcp_timewait_spike_percent: f64,
    pub tcp_timewait_sustained_seconds: i64,
    pub tcp_closewait_enabled: bool,
    pub tcp_closewait_spike_percent: f64,
    pub tcp_closewait_sustained_seconds: i64,
    pub tcp_synsent_enabled: bool,
    pub tcp_synsent_spike_percent: f64,
    pub tcp_synsent_sustained_seconds: i64,
    pub tcp_synrecv_enabled: bool,
    pub tcp_synrecv_spike_percent: f64,
    pub tcp_synrecv_sustained_seconds: i64,
    pub tcp_finwait_enabled: bool,
    pub tcp_finwait_spike_percent: f64,
    pub tcp_finwait_sustained_seconds: i64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: 60,
            alert_cooldown: 1800,
            language: "en".into(),
            telegram_bot_token: None,
            telegram_chat_id: None,
            excluded_server_ids: None,
            offline_enabled: true,
            offline_fail_threshold: 3,
            offline_recovery_notify: true,
            cpu_enabled: true,
            cpu_critical_threshold: 90.0,
            cpu_spike_percent: 200.0,
            cpu_sustained_seconds: 300,
            cpu_min_value: 0.0,
            ram_enabled: true,
            ram_critical_threshold: 90.0,
            ram_spike_percent: 200.0,
            ram_sustained_seconds: 300,
            ram_min_value: 0.0,
            network_enabled: true,
            network_spike_percent: 300.0,
            network_drop_percent: 80.0,
            network_sustained_seconds: 300,
            network_min_bytes: 0.0,
            tcp_min_connections: 0.0,
            tcp_established_enabled: false,
            tcp_established_spike_percent: 200.0,
            tcp_established_drop_percent: 80.0,
            tcp_established_sustained_seconds: 300,
            tcp_listen_enabled: false,
            tcp_listen_spike_percent: 200.0,
            tcp_listen_sustained_seconds: 300,
            tcp_timewait_enabled: false,
            tcp_timewait_spike_percent: 200.0,
            tcp_timewait_sustained_seconds: 300,
            tcp_closewait_enabled: false,
            tcp_closewait_spike_percent: 200.0,
            tcp_closewait_sustained_seconds: 300,
            tcp_synsent_enabled: false,
            tcp_synsent_spike_percent: 200.0,
            tcp_synsent_sustained_seconds: 300,
            tcp_synrecv_enabled: false,
            tcp_synrecv_spike_percent: 200.0,
            tcp_synrecv_sustained_seconds: 300,
            tcp_finwait_enabled: false,
            tcp_finwait_spike_percent: 200.0,
            tcp_finwait_sustained_seconds: 300,
        }
    }
}

impl AlertSettings {
    pub fn excluded_servers(&self) -> std::collections::HashSet<i64> {
        self.excluded_server_ids
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<i64>>(raw).ok())
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }
}

const SETTINGS_COLUMNS: &str = "enabled, check_interval, alert_cooldown, language, \
    telegram_bot_token, telegram_chat_id, excluded_server_ids, \
    offline_enabled, offline_fail_threshold, offline_recovery_notify, \
    cpu_enabled, cpu_critical_threshold, cpu_spike_percent, cpu_sustained_seconds, cpu_min_value, \
    ram_enabled, ram_critical_threshold, ram_spike_percent, ram_sustained_seconds, ram_min_value, \
    network_enabled, network_spike_percent, network_drop_percent, network_sustained_seconds, network_min_bytes, \
    tcp_min_connections, \
    tcp_established_enabled, tcp_established_spike_percent, tcp_established_drop_percent, tcp_established_sustained_seconds, \
    tcp_listen_enabled, tcp_listen_spike_percent, tcp_listen_sustained_seconds, \
    tcp_timewait_enabled, tcp_timewait_spike_percent, tcp_timewait_sustained_seconds, \
    tcp_closewait_enabled, tcp_closewait_spike_percent, tcp_closewait_sustained_seconds, \
    tcp_synsent_enabled, tcp_synsent_spike_percent, tcp_synsent_sustained_seconds, \
    tcp_synrecv_enabled, tcp_synrecv_spike_percent, tcp_synrecv_sustained_seconds, \
    tcp_finwait_enabled, tcp_finwait_spike_percent, tcp_finwait_sustained_seconds";

pub async fn alert_settings(pool: &SqlitePool) -> Result<AlertSettings> {
    let row = sqlx::query_as::<_, AlertSettings>(&format!(
        "SELECT {} FROM alert_settings WHERE id = 1",
        SETTINGS_COLUMNS
    ))
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or_default())
}

pub async fn save_alert_settings(pool: &SqlitePool, settings: &AlertSettings) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO alert_settings (
            id, enabled, check_interval, alert_cooldown, language,
            telegram_bot_token, telegram_chat_id, excluded_server_ids,
            offline_enabled, offline_fail_threshold, offline_recovery_notify,
            cpu_enabled, cpu_critical_threshold, cpu_spike_percent, cpu_sustained_seconds, cpu_min_value,
            ram_enabled, ram_critical_threshold, ram_spike_percent, ram_sustained_seconds, ram_min_value,
            network_enabled, network_spike_percent, network_drop_percent, network_sustained_seconds, network_min_bytes,
            tcp_min_connections,
            tcp_established_enabled, tcp_established_spike_percent, tcp_established_drop_percent, tcp_established_sustained_seconds,
            tcp_listen_enabled, tcp_listen_spike_percent, tcp_listen_sustained_seconds,
            tcp_timewait_enabled, tcp_timewait_spike_percent, tcp_timewait_sustained_seconds,
            tcp_closewait_enabled, tcp_closewait_spike_percent, tcp_closewait_sustained_seconds,
            tcp_synsent_enabled, tcp_synsent_spike_percent, tcp_synsent_sustained_seconds,
            tcp_synrecv_enabled, tcp_synrecv_spike_percent, tcp_synrecv_sustained_seconds,
            tcp_finwait_enabled, tcp_finwait_spike_percent, tcp_finwait_sustained_seconds
        ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            enabled = excluded.enabled,
            check_interval = excluded.check_interval,
            alert_cooldown = excluded.alert_cooldown,
            language = excluded.language,
            telegram_bot_token = excluded.telegram_bot_token,
            telegram_chat_id = excluded.telegram_chat_id,
            excluded_server_ids = excluded.excluded_server_ids,
            offline_enabled = excluded.offline_enabled,
            offline_fail_threshold = excluded.offline_fail_threshold,
            offline_recovery_notify = excluded.offline_recovery_notify,
            cpu_enabled = excluded.cpu_enabled,
            cpu_critical_threshold = excluded.cpu_critical_threshold,
            cpu_spike_percent = excluded.cpu_spike_percent,
            cpu_sustained_seconds = excluded.cpu_sustained_seconds,
            cpu_min_value = excluded.cpu_min_value,
            ram_enabled = excluded.ram_enabled,
            ram_critical_threshold = excluded.ram_critical_threshold,
            ram_spike_percent = excluded.ram_spike_percent,
            ram_sustained_seconds = excluded.ram_sustained_seconds,
            ram_min_value = excluded.ram_min_value,
            network_enabled = excluded.network_enabled,
            network_spike_percent = excluded.network_spike_percent,
            network_drop_percent = excluded.network_drop_percent,
            network_sustained_seconds = excluded.network_sustained_seconds,
            network_min_bytes = excluded.network_min_bytes,
            tcp_min_connections = excluded.tcp_min_connections,
            tcp_established_enabled = excluded.tcp_established_enabled,
            tcp_established_spike_percent = excluded.tcp_established_spike_percent,
            tcp_established_drop_percent = excluded.tcp_established_drop_percent,
            tcp_established_sustained_seconds = excluded.tcp_established_sustained_seconds,
            tcp_listen_enabled = excluded.tcp_listen_enabled,
            tcp_listen_spike_percent = excluded.tcp_listen_spike_percent,
            tcp_listen_sustained_seconds = excluded.tcp_listen_sustained_seconds,
            tcp_timewait_enabled = excluded.tcp_timewait_enabled,
            tcp_timewait_spike_percent = excluded.tcp_timewait_spike_percent,
            tcp_timewait_sustained_seconds = excluded.tcp_timewait_sustained_seconds,
            tcp_closewait_enabled = excluded.tcp_closewait_enabled,
            tcp_closewait_spike_percent = excluded.tcp_closewait_spike_percent,
            tcp_closewait_sustained_seconds = excluded.tcp_closewait_sustained_seconds,
            tcp_synsent_enabled = excluded.tcp_synsent_enabled,
            tcp_synsent_spike_percent = excluded.tcp_synsent_spike_percent,
            tcp_synsent_sustained_seconds = excluded.tcp_synsent_sustained_seconds,
            tcp_synrecv_enabled = excluded.tcp_synrecv_enabled,
            tcp_synrecv_spike_percent = excluded.tcp_synrecv_spike_percent,
            tcp_synrecv_sustained_seconds = excluded.tcp_synrecv_sustained_seconds,
            tcp_finwait_enabled = excluded.tcp_finwait_enabled,
            tcp_finwait_spike_percent = excluded.tcp_finwait_spike_percent,
            tcp_finwait_sustained_seconds = excluded.tcp_finwait_sustained_seconds
        "#,
    )
    .bind(settings.enabled)
    .bind(settings.check_interval)
    .bind(settings.alert_cooldown)
    .bind(&settings.language)
    .bind(&settings.telegram_bot_token)
    .bind(&settings.telegram_chat_id)
    .bind(&settings.excluded_server_ids)
    .bind(settings.offline_enabled)
    .bind(settings.offline_fail_threshold)
    .bind(settings.offline_recovery_notify)
    .bind(settings.cpu_enabled)
    .bind(settings.cpu_critical_threshold)
    .bind(settings.cpu_spike_percent)
    .bind(settings.cpu_sustained_seconds)
    .bind(settings.cpu_min_value)
    .bind(settings.ram_enabled)
    .bind(settings.ram_critical_threshold)
    .bind(settings.ram_spike_percent)
    .bind(settings.ram_sustained_seconds)
    .bind(settings.ram_min_value)
    .bind(settings.network_enabled)
    .bind(settings.network_spike_percent)
    .bind(settings.network_drop_percent)
    .bind(settings.network_sustained_seconds)
    .bind(settings.network_min_bytes)
    .bind(settings.tcp_min_connections)
    .bind(settings.tcp_established_enabled)
    .bind(settings.tcp_established_spike_percent)
    .bind(settings.tcp_established_drop_percent)
    .bind(settings.tcp_established_sustained_seconds)
    .bind(settings.tcp_listen_enabled)
    .bind(settings.tcp_listen_spike_percent)
    .bind(settings.tcp_listen_sustained_seconds)
    .bind(settings.tcp_timewait_enabled)
    .bind(settings.tcp_timewait_spike_percent)
    .bind(settings.tcp_timewait_sustained_seconds)
    .bind(settings.tcp_closewait_enabled)
    .bind(settings.tcp_closewait_spike_percent)
    .bind(settings.tcp_closewait_sustained_seconds)
    .bind(settings.tcp_synsent_enabled)
    .bind(settings.tcp_synsent_spike_percent)
    .bind(settings.tcp_synsent_sustained_seconds)
    .bind(settings.tcp_synrecv_enabled)
    .bind(settings.tcp_synrecv_spike_percent)
    .bind(settings.tcp_synrecv_sustained_seconds)
    .bind(settings.tcp_finwait_enabled)
    .bind(settings.tcp_finwait_spike_percent)
    .bind(settings.tcp_finwait_sustained_seconds)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AlertHistoryEntry {
    pub id: i64,
    pub server_id: Option<i64>,
    pub server_name: Option<String>,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    pub details: Option<String>,
    pub notified: bool,
    pub created_at: NaiveDateTime,
}

pub async fn record_alert(
    pool: &SqlitePool,
    server_id: i64,
    server_name: &str,
    alert_type: &str,
    severity: &str,
    message: &str,
    details: &str,
    notified: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO alert_history (server_id, server_name, alert_type, severity, message, details, notified) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(server_id)
    .bind(server_name)
    .bind(alert_type)
    .bind(severity)
    .bind(message)
    .bind(details)
    .bind(notified)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn alert_history(pool: &SqlitePool, limit: i64) -> Result<Vec<AlertHistoryEntry>> {
    let rows = sqlx::query_as::<_, AlertHistoryEntry>(
        "SELECT id, server_id, server_name, alert_type, severity, message, details, notified, \
         created_at FROM alert_history ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    #[tokio::test]
    async fn settings_default_then_persist() {
        let pool = open_in_memory().await.unwrap();
        let settings = alert_settings(&pool).await.unwrap();
        assert_eq!(settings.alert_cooldown, 1800);
        assert_eq!(settings.cpu_critical_threshold, 90.0);

        let mut updated = settings;
        updated.enabled = true;
        updated.cpu_critical_threshold = 95.0;
        updated.excluded_server_ids = Some("[3, 7]".into());
        save_alert_settings(&pool, &updated).await.unwrap();

        let loaded = alert_settings(&pool).await.unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.cpu_critical_threshold, 95.0);
        let excluded = loaded.excluded_servers();
        assert!(excluded.contains(&3) && excluded.contains(&7));
    }

    #[tokio::test]
    async fn history_records_regardless_of_notification() {
        let pool = open_in_memory().await.unwrap();
        record_alert(&pool, 1, "edge-1", "cpu_critical", "critical", "CPU high", "{}", false)
            .await
            .unwrap();
        record_alert(&pool, 1, "edge-1", "recovery", "info", "back online", "{}", true)
            .await
            .unwrap();

        let history = alert_history(&pool, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|entry| !entry.notified));
    }
}
