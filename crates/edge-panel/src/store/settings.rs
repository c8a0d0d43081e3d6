//! Panel settings: a generic key/value table plus the single-row typed
//! settings for the Remnawave integration.

use crate::error::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashSet;
use tracing::warn;

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM panel_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value)
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO panel_settings (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_int_setting(
    pool: &SqlitePool,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64> {
    let value = get_setting(pool, key)
        .await?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default);
    Ok(value.clamp(min, max))
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RemnawaveSettings {
    pub enabled: bool,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub cookie_secret: Option<String>,
    pub collection_interval: i64,
    pub ignored_user_ids: Option<String>,
    pub visit_stats_retention_days: i64,
    pub hourly_stats_retention_days: i64,
}

impl Default for RemnawaveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: None,
            api_token: None,
            cookie_secret: None,
            collection_interval: 300,
            ignored_user_ids: None,
            visit_stats_retention_days: 365,
            hourly_stats_retention_days: 365,
        }
    }
}

impl RemnawaveSettings {
    /// Parse the ignored-users JSON array defensively; malformed data
    /// yields an empty set rather than an error.
    pub fn ignored_users(&self) -> HashSet<i64> {
        let Some(raw) = &self.ignored_user_ids else {
            return HashSet::new();
        };
        match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
            Ok(values) => values
                .into_iter()
                .filter_map(|v| match v {
                    serde_json::Value::Number(n) => n.as_i64(),
                    serde_json::Value::String(s) => s.parse().ok(),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                warn!("malformed ignored_user_ids: {}", e);
                HashSet::new()
            }
        }
    }
}

pub async fn remnawave_settings(pool: &SqlitePool) -> Result<RemnawaveSettings> {
    let row = sqlx::query_as::<_, RemnawaveSettings>(
        "SELECT enabled, api_url, api_token, cookie_secret, collection_interval, \
         ignored_user_ids, visit_stats_retention_days, hourly_stats_retention_days \
         FROM remnawave_settings WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or_default())
}

pub async fn save_remnawave_settings(
    pool: &SqlitePool,
    settings: &RemnawaveSettings,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO remnawave_settings
            (id, enabled, api_url, api_token, cookie_secret, collection_interval,
             ignored_user_ids, visit_stats_retention_days, hourly_stats_retention_days)
        VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            enabled = excluded.enabled,
            api_url = excluded.api_url,
            api_token = excluded.api_token,
            cookie_secret = excluded.cookie_secret,
            collection_interval = excluded.collection_interval,
            ignored_user_ids = excluded.ignored_user_ids,
            visit_stats_retention_days = excluded.visit_stats_retention_days,
            hourly_stats_retention_days = excluded.hourly_stats_retention_days
        "#,
    )
    .bind(settings.enabled)
    .bind(&settings.api_url)
    .bind(&settings.api_token)
    .bind(&settings.cookie_secret)
    .bind(settings.collection_interval)
    .bind(&settings.ignored_user_ids)
    .bind(settings.visit_stats_retention_days)
    .bind(settings.hourly_stats_retention_days)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RemnawaveNodeRow {
    pub id: i64,
    pub server_id: i64,
    pub enabled: bool,
    pub last_collected: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

pub async fn enabled_nodes(pool: &SqlitePool) -> Result<Vec<(RemnawaveNodeRow, super::servers::Server)>> {
    let nodes = sqlx::query_as::<_, RemnawaveNodeRow>(
        "SELECT id, server_id, enabled, last_collected, last_error FROM remnawave_nodes \
         WHERE enabled = 1",
    )
    .fetch_all(pool)
    .await?;

    let mut result = Vec::new();
    for node in nodes {
        if let Ok(server) = super::servers::get(pool, node.server_id).await {
            if server.is_active {
                result.push((node, server));
            }
        }
    }
    Ok(result)
}

pub async fn ensure_node(pool: &SqlitePool, server_id: i64, enabled: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO remnawave_nodes (server_id, enabled) VALUES (?, ?) \
         ON CONFLICT(server_id) DO UPDATE SET enabled = excluded.enabled",
    )
    .bind(server_id)
    .bind(enabled)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_node_status(
    pool: &SqlitePool,
    node_id: i64,
    error: Option<&str>,
    now: NaiveDateTime,
) -> Result<()> {
    match error {
        None => {
            sqlx::query(
                "UPDATE remnawave_nodes SET last_collected = ?, last_error = NULL WHERE id = ?",
            )
            .bind(now)
            .bind(node_id)
            .execute(pool)
            .await?;
        }
        Some(message) => {
            sqlx::query("UPDATE remnawave_nodes SET last_error = ? WHERE id = ?")
                .bind(message)
                .bind(node_id)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

pub async fn excluded_destinations(pool: &SqlitePool) -> Result<HashSet<String>> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT destination FROM remnawave_excluded_destinations")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

pub async fn infrastructure_addresses(pool: &SqlitePool) -> Result<Vec<(i64, String, Option<String>)>> {
    let rows: Vec<(i64, String, Option<String>)> = sqlx::query_as(
        "SELECT id, address, resolved_ips FROM remnawave_infrastructure_addresses",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn save_resolved_ips(
    pool: &SqlitePool,
    id: i64,
    resolved_json: Option<&str>,
    now: NaiveDateTime,
) -> Result<()> {
    sqlx::query(
        "UPDATE remnawave_infrastructure_addresses SET resolved_ips = ?, last_resolved = ? WHERE id = ?",
    )
    .bind(resolved_json)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    #[tokio::test]
    async fn kv_settings_round_trip() {
        let pool = open_in_memory().await.unwrap();
        assert!(get_setting(&pool, "metrics_collect_interval")
            .await
            .unwrap()
            .is_none());

        set_setting(&pool, "metrics_collect_interval", "15").await.unwrap();
        set_setting(&pool, "metrics_collect_interval", "20").await.unwrap();
        assert_eq!(
            get_setting(&pool, "metrics_collect_interval").await.unwrap(),
            Some("20".into())
        );

        // Clamped read.
        assert_eq!(
            get_int_setting(&pool, "metrics_collect_interval", 10, 5, 300)
                .await
                .unwrap(),
            20
        );
        set_setting(&pool, "metrics_collect_interval", "100000").await.unwrap();
        assert_eq!(
            get_int_setting(&pool, "metrics_collect_interval", 10, 5, 300)
                .await
                .unwrap(),
            300
        );
    }

    #[tokio::test]
    async fn remnawave_settings_defaults_and_save() {
        let pool = open_in_memory().await.unwrap();
        let settings = remnawave_settings(&pool).await.unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.collection_interval, 300);

        let mut updated = settings.clone();
        updated.enabled = true;
        updated.ignored_user_ids = Some("[1, \"2\", null, \"x\"]".into());
        save_remnawave_settings(&pool, &updated).await.unwrap();

        let loaded = remnawave_settings(&pool).await.unwrap();
        assert!(loaded.enabled);
        let ignored = loaded.ignored_users();
        assert!(ignored.contains(&1));
        assert!(ignored.contains(&2));
        assert_eq!(ignored.len(), 2);
    }

    #[tokio::test]
    async fn malformed_ignored_users_is_empty() {
        let settings = RemnawaveSettings {
            ignored_user_ids: Some("not json".into()),
            ..Default::default()
        };
        assert!(settings.ignored_users().is_empty());
    }
}
