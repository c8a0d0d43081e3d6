//! Anomaly analyzer storage: analyzer settings, traffic baselines, the
//! anomaly audit log, the upstream user cache and the ASN cache.

use crate::error::Result;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    pub enabled: bool,
    pub check_interval_minutes: i64,
    pub traffic_limit_gb: f64,
    pub ip_limit_multiplier: f64,
    pub check_hwid_anomalies: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub last_check_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_minutes: 30,
            traffic_limit_gb: 100.0,
            ip_limit_multiplier: 2.0,
            check_hwid_anomalies: true,
            telegram_bot_token: None,
            telegram_chat_id: None,
            last_check_at: None,
            last_error: None,
        }
    }
}

pub async fn analyzer_settings(pool: &SqlitePool) -> Result<AnalyzerSettings> {
    let row = sqlx::query_as::<_, AnalyzerSettings>(
        "SELECT enabled, check_interval_minutes, traffic_limit_gb, ip_limit_multiplier, \
         check_hwid_anomalies, telegram_bot_token, telegram_chat_id, last_check_at, last_error \
         FROM traffic_analyzer_settings WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or_default())
}

pub async fn save_analyzer_settings(pool: &SqlitePool, settings: &AnalyzerSettings) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO traffic_analyzer_settings
            (id, enabled, check_interval_minutes, traffic_limit_gb, ip_limit_multiplier,
             check_hwid_anomalies, telegram_bot_token, telegram_chat_id)
        VALUES (1, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            enabled = excluded.enabled,
            check_interval_minutes = excluded.check_interval_minutes,
            traffic_limit_gb = excluded.traffic_limit_gb,
            ip_limit_multiplier = excluded.ip_limit_multiplier,
            check_hwid_anomalies = excluded.check_hwid_anomalies,
            telegram_bot_token = excluded.telegram_bot_token,
            telegram_chat_id = excluded.telegram_chat_id
        "#,
    )
    .bind(settings.enabled)
    .bind(settings.check_interval_minutes)
    .bind(settings.traffic_limit_gb)
    .bind(settings.ip_limit_multiplier)
    .bind(settings.check_hwid_anomalies)
    .bind(&settings.telegram_bot_token)
    .bind(&settings.telegram_chat_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_analyzer_run(
    pool: &SqlitePool,
    now: NaiveDateTime,
    error: Option<&str>,
) -> Result<()> {
    match error {
        None => {
            sqlx::query(
                "UPDATE traffic_analyzer_settings SET last_check_at = ?, last_error = NULL WHERE id = 1",
            )
            .bind(now)
            .execute(pool)
            .await?;
        }
        Some(message) => {
            sqlx::query("UPDATE traffic_analyzer_settings SET last_error = ? WHERE id = 1")
                .bind(message)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Baseline for delta-based traffic anomaly detection. Returns the
/// previous value, or None on the first observation.
pub async fn swap_traffic_snapshot(
    pool: &SqlitePool,
    user_email: i64,
    current_bytes: i64,
    now: NaiveDateTime,
) -> Result<Option<i64>> {
    let previous: Option<i64> =
        sqlx::query_scalar("SELECT traffic_bytes FROM user_traffic_snapshots WHERE user_email = ?")
            .bind(user_email)
            .fetch_optional(pool)
            .await?;

    sqlx::query(
        "INSERT INTO user_traffic_snapshots (user_email, traffic_bytes, snapshot_at) VALUES (?, ?, ?) \
         ON CONFLICT(user_email) DO UPDATE SET traffic_bytes = excluded.traffic_bytes, \
         snapshot_at = excluded.snapshot_at",
    )
    .bind(user_email)
    .bind(current_bytes)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(previous)
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AnomalyEntry {
    pub id: i64,
    pub user_email: i64,
    pub username: Option<String>,
    pub anomaly_type: String,
    pub severity: String,
    pub details: Option<String>,
    pub notified: bool,
    pub resolved: bool,
    pub created_at: NaiveDateTime,
}

/// An anomaly of the same type for the same user is suppressed while an
/// unresolved one from the last 24 h exists.
pub async fn has_recent_unresolved(
    pool: &SqlitePool,
    user_email: i64,
    anomaly_type: &str,
    now: NaiveDateTime,
) -> Result<bool> {
    let cutoff = now - Duration::hours(24);
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM traffic_anomaly_log \
         WHERE user_email = ? AND anomaly_type = ? AND created_at >= ? AND resolved = 0 LIMIT 1",
    )
    .bind(user_email)
    .bind(anomaly_type)
    .bind(cutoff)
    .fetch_optional(pool)
    .await?;
    Ok(existing.is_some())
}

pub async fn record_anomaly(
    pool: &SqlitePool,
    user_email: i64,
    username: Option<&str>,
    anomaly_type: &str,
    severity: &str,
    details: &str,
    now: NaiveDateTime,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO traffic_anomaly_log \
         (user_email, username, anomaly_type, severity, details, notified, resolved, created_at) \
         VALUES (?, ?, ?, ?, ?, 0, 0, ?)",
    )
    .bind(user_email)
    .bind(username)
    .bind(anomaly_type)
    .bind(severity)
    .bind(details)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn mark_notified(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE traffic_anomaly_log SET notified = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn resolve_anomaly(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE traffic_anomaly_log SET resolved = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_anomalies(pool: &SqlitePool, limit: i64) -> Result<Vec<AnomalyEntry>> {
    let rows = sqlx::query_as::<_, AnomalyEntry>(
        "SELECT id, user_email, username, anomaly_type, severity, details, notified, resolved, \
         created_at FROM traffic_anomaly_log ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ── upstream user cache ──

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CachedUser {
    pub email: i64,
    pub uuid: Option<String>,
    pub username: Option<String>,
    pub telegram_id: Option<String>,
    pub status: Option<String>,
    pub used_traffic_bytes: Option<i64>,
    pub hwid_device_limit: Option<i64>,
    pub sub_last_user_agent: Option<String>,
    pub updated_at: Option<NaiveDateTime>,
}

pub async fn cached_users(pool: &SqlitePool) -> Result<Vec<CachedUser>> {
    let rows = sqlx::query_as::<_, CachedUser>(
        "SELECT email, uuid, username, telegram_id, status, used_traffic_bytes, \
         hwid_device_limit, sub_last_user_agent, updated_at FROM remnawave_user_cache ORDER BY email",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, Default)]
pub struct UserCacheRow {
    pub email: i64,
    pub uuid: Option<String>,
    pub short_uuid: Option<String>,
    pub username: Option<String>,
    pub telegram_id: Option<String>,
    pub status: Option<String>,
    pub expire_at: Option<NaiveDateTime>,
    pub subscription_url: Option<String>,
    pub sub_last_user_agent: Option<String>,
    pub sub_last_opened_at: Option<NaiveDateTime>,
    pub traffic_limit_bytes: Option<i64>,
    pub traffic_limit_strategy: Option<String>,
    pub last_traffic_reset_at: Option<NaiveDateTime>,
    pub used_traffic_bytes: Option<i64>,
    pub lifetime_used_traffic_bytes: Option<i64>,
    pub online_at: Option<NaiveDateTime>,
    pub first_connected_at: Option<NaiveDateTime>,
    pub hwid_device_limit: Option<i64>,
    pub user_email: Option<String>,
    pub description: Option<String>,
    pub tag: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

pub const USER_CACHE_BATCH_SIZE: usize = 500;

pub async fn upsert_user_cache(
    pool: &SqlitePool,
    users: &[UserCacheRow],
    now: NaiveDateTime,
) -> Result<()> {
    for chunk in users.chunks(USER_CACHE_BATCH_SIZE) {
        let mut tx = pool.begin().await?;
        for user in chunk {
            sqlx::query(
                r#"
                INSERT INTO remnawave_user_cache (
                    email, uuid, short_uuid, username, telegram_id, status, expire_at,
                    subscription_url, sub_last_user_agent, sub_last_opened_at,
                    traffic_limit_bytes, traffic_limit_strategy, last_traffic_reset_at,
                    used_traffic_bytes, lifetime_used_traffic_bytes, online_at,
                    first_connected_at, hwid_device_limit, user_email, description, tag,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(email) DO UPDATE SET
                    uuid = excluded.uuid,
                    short_uuid = excluded.short_uuid,
                    username = excluded.username,
                    telegram_id = excluded.telegram_id,
                    status = excluded.status,
                    expire_at = excluded.expire_at,
                    subscription_url = excluded.subscription_url,
                    sub_last_user_agent = excluded.sub_last_user_agent,
                    sub_last_opened_at = excluded.sub_last_opened_at,
                    traffic_limit_bytes = excluded.traffic_limit_bytes,
                    traffic_limit_strategy = excluded.traffic_limit_strategy,
                    last_traffic_reset_at = excluded.last_traffic_reset_at,
                    used_traffic_bytes = excluded.used_traffic_bytes,
                    lifetime_used_traffic_bytes = excluded.lifetime_used_traffic_bytes,
                    online_at = excluded.online_at,
                    first_connected_at = excluded.first_connected_at,
                    hwid_device_limit = excluded.hwid_device_limit,
                    user_email = excluded.user_email,
                    description = excluded.description,
                    tag = excluded.tag,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(user.email)
            .bind(&user.uuid)
            .bind(&user.short_uuid)
            .bind(&user.username)
            .bind(&user.telegram_id)
            .bind(&user.status)
            .bind(user.expire_at)
            .bind(&user.subscription_url)
            .bind(&user.sub_last_user_agent)
            .bind(user.sub_last_opened_at)
            .bind(user.traffic_limit_bytes)
            .bind(&user.traffic_limit_strategy)
            .bind(user.last_traffic_reset_at)
            .bind(user.used_traffic_bytes)
            .bind(user.lifetime_used_traffic_bytes)
            .bind(user.online_at)
            .bind(user.first_connected_at)
            .bind(user.hwid_device_limit)
            .bind(&user.user_email)
            .bind(&user.description)
            .bind(&user.tag)
            .bind(user.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }
    Ok(())
}

/// Drop cached users the upstream no longer reports.
pub async fn delete_users_not_in(pool: &SqlitePool, emails: &[i64]) -> Result<u64> {
    if emails.is_empty() {
        return Ok(0);
    }
    let placeholders = emails.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "DELETE FROM remnawave_user_cache WHERE email NOT IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql);
    for email in emails {
        query = query.bind(email);
    }
    Ok(query.execute(pool).await?.rows_affected())
}

// ── ASN cache ──

pub const ASN_CACHE_TTL_DAYS: i64 = 7;

pub async fn asn_cache_get(
    pool: &SqlitePool,
    ip: &str,
    now: NaiveDateTime,
) -> Result<Option<(Option<String>, Option<String>)>> {
    let cutoff = now - Duration::days(ASN_CACHE_TTL_DAYS);
    let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT asn, prefix FROM asn_cache WHERE ip = ? AND cached_at >= ?",
    )
    .bind(ip)
    .bind(cutoff)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn asn_cache_put(
    pool: &SqlitePool,
    ip: &str,
    asn: Option<&str>,
    prefix: Option<&str>,
    now: NaiveDateTime,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO asn_cache (ip, asn, prefix, cached_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(ip) DO UPDATE SET asn = excluded.asn, prefix = excluded.prefix, \
         cached_at = excluded.cached_at",
    )
    .bind(ip)
    .bind(asn)
    .bind(prefix)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[tokio::test]
    async fn traffic_snapshot_swap_returns_previous() {
        let pool = open_in_memory().await.unwrap();
        let now = ts("2026-01-01 00:00:00");

        assert_eq!(swap_traffic_snapshot(&pool, 42, 100, now).await.unwrap(), None);
        assert_eq!(
            swap_traffic_snapshot(&pool, 42, 250, now).await.unwrap(),
            Some(100)
        );
        assert_eq!(
            swap_traffic_snapshot(&pool, 42, 50, now).await.unwrap(),
            Some(250)
        );
    }

    #[tokio::test]
    async fn anomaly_dedup_window() {
        let pool = open_in_memory().await.unwrap();
        let now = ts("2026-01-02 12:00:00");

        assert!(!has_recent_unresolved(&pool, 42, "traffic", now).await.unwrap());
        let id = record_anomaly(&pool, 42, Some("bob"), "traffic", "critical", "{}", now)
            .await
            .unwrap();
        assert!(has_recent_unresolved(&pool, 42, "traffic", now).await.unwrap());
        // Different type is tracked independently.
        assert!(!has_recent_unresolved(&pool, 42, "ip_count", now).await.unwrap());

        resolve_anomaly(&pool, id).await.unwrap();
        assert!(!has_recent_unresolved(&pool, 42, "traffic", now).await.unwrap());
    }

    #[tokio::test]
    async fn user_cache_upsert_and_prune() {
        let pool = open_in_memory().await.unwrap();
        let now = ts("2026-01-01 00:00:00");

        let users = vec![
            UserCacheRow {
                email: 1,
                username: Some("alice".into()),
                used_traffic_bytes: Some(100),
                ..Default::default()
            },
            UserCacheRow {
                email: 2,
                username: Some("bob".into()),
                ..Default::default()
            },
        ];
        upsert_user_cache(&pool, &users, now).await.unwrap();

        // Upstream no longer knows user 2.
        let pruned = delete_users_not_in(&pool, &[1]).await.unwrap();
        assert_eq!(pruned, 1);
        let remaining = cached_users(&pool).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].email, 1);
    }

    #[tokio::test]
    async fn asn_cache_respects_ttl() {
        let pool = open_in_memory().await.unwrap();
        let cached_at = ts("2026-01-01 00:00:00");
        asn_cache_put(&pool, "1.1.1.1", Some("AS13335"), Some("1.1.1.0/24"), cached_at)
            .await
            .unwrap();

        let fresh = asn_cache_get(&pool, "1.1.1.1", ts("2026-01-05 00:00:00"))
            .await
            .unwrap();
        assert_eq!(fresh.unwrap().0.as_deref(), Some("AS13335"));

        // Expired after seven days.
        let stale = asn_cache_get(&pool, "1.1.1.1", ts("2026-01-09 00:00:00"))
            .await
            .unwrap();
        assert!(stale.is_none());
    }
}
