//! The Xray fact table and its derived summaries.
//!
//! `xray_stats` is the only table holding per-(user, IP, host) visit
//! counts. Summary projections are rebuilt by full scan after each
//! collection cycle and must always be derivable from it.

use crate::error::Result;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;

pub const UPSERT_BATCH_SIZE: usize = 500;

/// Only (email, source_ip) groups with at least this many visits count
/// as active client IPs in the user summary and ASN clustering.
pub const MIN_ASN_VISIT_COUNT: i64 = 1000;

/// Merge one collection's deltas into the fact table in chunks.
///
/// `count` only ever grows between clears; `last_seen` advances to the
/// merge time.
pub async fn upsert_stats(
    pool: &SqlitePool,
    updates: &HashMap<(i64, String, String), i64>,
    now: NaiveDateTime,
) -> Result<()> {
    let items: Vec<_> = updates.iter().collect();
    for chunk in items.chunks(UPSERT_BATCH_SIZE) {
        let mut tx = pool.begin().await?;
        for ((email, source_ip, host), count) in chunk {
            sqlx::query(
                r#"
                INSERT INTO xray_stats (email, source_ip, host, count, first_seen, last_seen)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(email, source_ip, host) DO UPDATE SET
                    count = count + excluded.count,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(email)
            .bind(source_ip)
            .bind(host)
            .bind(count)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }
    Ok(())
}

/// Accumulate one collection into the fleet-wide hourly row
/// (`server_id = 0`). Visits add up; unique counts are refreshed with
/// the latest collection's values.
pub async fn upsert_hourly(
    pool: &SqlitePool,
    hour: NaiveDateTime,
    visit_count: i64,
    unique_users: i64,
    unique_destinations: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO xray_hourly_stats (server_id, hour, visit_count, unique_users, unique_destinations)
        VALUES (0, ?, ?, ?, ?)
        ON CONFLICT(server_id, hour) DO UPDATE SET
            visit_count = visit_count + excluded.visit_count,
            unique_users = excluded.unique_users,
            unique_destinations = excluded.unique_destinations
        "#,
    )
    .bind(hour)
    .bind(visit_count)
    .bind(unique_users)
    .bind(unique_destinations)
    .execute(pool)
    .await?;
    Ok(())
}

/// Rebuild the three summary projections from a full fact-table scan.
/// Reconstruction is idempotent.
pub async fn rebuild_summaries(pool: &SqlitePool, infrastructure_ips: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO xray_global_summary (id, total_visits, unique_users, unique_destinations, last_updated)
        SELECT 1, COALESCE(SUM(count), 0), COUNT(DISTINCT email), COUNT(DISTINCT host), datetime('now')
        FROM xray_stats
        ON CONFLICT(id) DO UPDATE SET
            total_visits = excluded.total_visits,
            unique_users = excluded.unique_users,
            unique_destinations = excluded.unique_destinations,
            last_updated = excluded.last_updated
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM xray_destination_summary")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO xray_destination_summary (host, total_visits, unique_users, last_seen)
        SELECT host, SUM(count), COUNT(DISTINCT email), MAX(last_seen)
        FROM xray_stats
        GROUP BY host
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM xray_user_summary")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO xray_user_summary
            (email, total_visits, unique_sites, unique_client_ips, infrastructure_ips, first_seen, last_seen)
        SELECT email, SUM(count), COUNT(DISTINCT host), 0, 0, MIN(first_seen), MAX(last_seen)
        FROM xray_stats
        GROUP BY email
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Client-IP counts: only (email, source_ip) groups with enough
    // visits, and never infrastructure addresses.
    let placeholders: String = if infrastructure_ips.is_empty() {
        "''".to_string()
    } else {
        infrastructure_ips
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",")
    };
    let update_sql = format!(
        r#"
        UPDATE xray_user_summary SET
            unique_client_ips = COALESCE((
                SELECT COUNT(*) FROM (
                    SELECT email AS grp_email, source_ip AS grp_ip, SUM(count) AS ip_total
                    FROM xray_stats GROUP BY email, source_ip
                ) WHERE grp_email = xray_user_summary.email
                    AND ip_total >= {min_visits}
                    AND grp_ip NOT IN ({placeholders})
            ), 0),
            infrastructure_ips = COALESCE((
                SELECT COUNT(DISTINCT source_ip) FROM xray_stats
                WHERE xray_stats.email = xray_user_summary.email
                    AND source_ip IN ({placeholders})
            ), 0)
        "#,
        min_visits = MIN_ASN_VISIT_COUNT,
        placeholders = placeholders,
    );
    let mut query = sqlx::query(&update_sql);
    for _ in 0..2 {
        for ip in infrastructure_ips {
            query = query.bind(ip);
        }
    }
    query.execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GlobalSummary {
    pub total_visits: i64,
    pub unique_users: i64,
    pub unique_destinations: i64,
    pub last_updated: Option<NaiveDateTime>,
}

pub async fn global_summary(pool: &SqlitePool) -> Result<GlobalSummary> {
    let row = sqlx::query_as::<_, GlobalSummary>(
        "SELECT total_visits, unique_users, unique_destinations, last_updated \
         FROM xray_global_summary WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or(GlobalSummary {
        total_visits: 0,
        unique_users: 0,
        unique_destinations: 0,
        last_updated: None,
    }))
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DestinationSummary {
    pub host: String,
    pub total_visits: i64,
    pub unique_users: i64,
    pub last_seen: Option<NaiveDateTime>,
}

pub async fn top_destinations(pool: &SqlitePool, limit: i64) -> Result<Vec<DestinationSummary>> {
    let rows = sqlx::query_as::<_, DestinationSummary>(
        "SELECT host, total_visits, unique_users, last_seen FROM xray_destination_summary \
         ORDER BY total_visits DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Period-scoped destination query: bypasses the projection and scans
/// the fact table with a `last_seen` cutoff.
pub async fn top_destinations_since(
    pool: &SqlitePool,
    cutoff: NaiveDateTime,
    limit: i64,
) -> Result<Vec<DestinationSummary>> {
    let rows = sqlx::query_as::<_, DestinationSummary>(
        "SELECT host, SUM(count) AS total_visits, COUNT(DISTINCT email) AS unique_users, \
         MAX(last_seen) AS last_seen \
         FROM xray_stats WHERE last_seen >= ? GROUP BY host ORDER BY total_visits DESC LIMIT ?",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserSummary {
    pub email: i64,
    pub total_visits: i64,
    pub unique_sites: i64,
    pub unique_client_ips: i64,
    pub infrastructure_ips: i64,
    pub first_seen: Option<NaiveDateTime>,
    pub last_seen: Option<NaiveDateTime>,
}

pub async fn top_users(pool: &SqlitePool, limit: i64) -> Result<Vec<UserSummary>> {
    let rows = sqlx::query_as::<_, UserSummary>(
        "SELECT email, total_visits, unique_sites, unique_client_ips, infrastructure_ips, \
         first_seen, last_seen \
         FROM xray_user_summary ORDER BY total_visits DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn user_summary(pool: &SqlitePool, email: i64) -> Result<Option<UserSummary>> {
    let row = sqlx::query_as::<_, UserSummary>(
        "SELECT email, total_visits, unique_sites, unique_client_ips, infrastructure_ips, \
         first_seen, last_seen FROM xray_user_summary WHERE email = ?",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn top_users_since(
    pool: &SqlitePool,
    cutoff: NaiveDateTime,
    limit: i64,
) -> Result<Vec<UserSummary>> {
    let rows = sqlx::query_as::<_, UserSummary>(
        "SELECT email, SUM(count) AS total_visits, COUNT(DISTINCT host) AS unique_sites, \
         0 AS unique_client_ips, 0 AS infrastructure_ips, \
         MIN(first_seen) AS first_seen, MAX(last_seen) AS last_seen \
         FROM xray_stats WHERE last_seen >= ? GROUP BY email \
         ORDER BY total_visits DESC LIMIT ?",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// All of one user's source IPs with visit totals in a window, minus
/// infrastructure addresses. Input for ASN clustering.
pub async fn user_ip_visits(
    pool: &SqlitePool,
    email: i64,
    cutoff: NaiveDateTime,
    infrastructure_ips: &[String],
) -> Result<HashMap<String, i64>> {
    let placeholders = if infrastructure_ips.is_empty() {
        "''".to_string()
    } else {
        infrastructure_ips
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",")
    };
    let sql = format!(
        "SELECT source_ip, SUM(count) FROM xray_stats \
         WHERE email = ? AND last_seen >= ? AND source_ip NOT IN ({}) \
         GROUP BY source_ip",
        placeholders
    );
    let mut query = sqlx::query_as::<_, (String, i64)>(&sql).bind(email).bind(cutoff);
    for ip in infrastructure_ips {
        query = query.bind(ip);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().collect())
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HourlyStat {
    pub server_id: i64,
    pub hour: NaiveDateTime,
    pub visit_count: i64,
    pub unique_users: i64,
    pub unique_destinations: i64,
}

pub async fn hourly_stats(pool: &SqlitePool, since: NaiveDateTime) -> Result<Vec<HourlyStat>> {
    let rows = sqlx::query_as::<_, HourlyStat>(
        "SELECT server_id, hour, visit_count, unique_users, unique_destinations \
         FROM xray_hourly_stats WHERE hour >= ? ORDER BY hour",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Retention cleanup. Returns the number of fact rows removed so the
/// caller can decide whether to VACUUM.
pub async fn cleanup(
    pool: &SqlitePool,
    now: NaiveDateTime,
    stats_retention_days: i64,
    hourly_retention_days: i64,
) -> Result<u64> {
    let stats_cutoff = now - Duration::days(stats_retention_days);
    let deleted = sqlx::query("DELETE FROM xray_stats WHERE last_seen < ?")
        .bind(stats_cutoff)
        .execute(pool)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM xray_hourly_stats WHERE hour < ?")
        .bind(now - Duration::days(hourly_retention_days))
        .execute(pool)
        .await?;

    sqlx::query("DELETE FROM remnawave_user_cache WHERE updated_at < ?")
        .bind(now - Duration::days(7))
        .execute(pool)
        .await?;

    Ok(deleted)
}

pub async fn vacuum(pool: &SqlitePool) -> Result<()> {
    sqlx::query("VACUUM").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn updates(
        entries: &[(i64, &str, &str, i64)],
    ) -> HashMap<(i64, String, String), i64> {
        entries
            .iter()
            .map(|(email, ip, host, count)| {
                ((*email, ip.to_string(), host.to_string()), *count)
            })
            .collect()
    }

    #[tokio::test]
    async fn counts_are_monotonic_across_merges() {
        let pool = open_in_memory().await.unwrap();
        let now = ts("2026-01-01 10:00:00");

        upsert_stats(&pool, &updates(&[(42, "9.9.9.9", "a.com", 2)]), now)
            .await
            .unwrap();
        upsert_stats(
            &pool,
            &updates(&[(42, "9.9.9.9", "a.com", 3)]),
            ts("2026-01-01 11:00:00"),
        )
        .await
        .unwrap();

        let (count, first_seen, last_seen): (i64, NaiveDateTime, NaiveDateTime) =
            sqlx::query_as(
                "SELECT count, first_seen, last_seen FROM xray_stats \
                 WHERE email = 42 AND source_ip = '9.9.9.9' AND host = 'a.com'",
            )
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(first_seen, ts("2026-01-01 10:00:00"));
        assert_eq!(last_seen, ts("2026-01-01 11:00:00"));
    }

    #[tokio::test]
    async fn summary_rebuild_matches_fact_table() {
        let pool = open_in_memory().await.unwrap();
        let now = ts("2026-01-01 10:00:00");

        // The seed scenario: user 42, two hosts, one source IP.
        upsert_stats(
            &pool,
            &updates(&[(42, "9.9.9.9", "a.com", 2), (42, "9.9.9.9", "b.com", 1)]),
            now,
        )
        .await
        .unwrap();

        rebuild_summaries(&pool, &[]).await.unwrap();

        let global = global_summary(&pool).await.unwrap();
        assert_eq!(global.total_visits, 3);
        assert_eq!(global.unique_users, 1);
        assert_eq!(global.unique_destinations, 2);

        let destinations = top_destinations(&pool, 10).await.unwrap();
        assert_eq!(destinations[0].host, "a.com");
        assert_eq!(destinations[0].total_visits, 2);

        let user = user_summary(&pool, 42).await.unwrap().unwrap();
        assert_eq!(user.unique_sites, 2);
        assert_eq!(user.total_visits, 3);
        // Below the visit threshold: the IP is not an active client IP.
        assert_eq!(user.unique_client_ips, 0);
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        upsert_stats(
            &pool,
            &updates(&[(1, "1.1.1.1", "x.com", 7)]),
            ts("2026-01-01 10:00:00"),
        )
        .await
        .unwrap();

        rebuild_summaries(&pool, &[]).await.unwrap();
        rebuild_summaries(&pool, &[]).await.unwrap();

        let global = global_summary(&pool).await.unwrap();
        assert_eq!(global.total_visits, 7);
        assert_eq!(top_destinations(&pool, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn client_ip_threshold_and_infrastructure_exclusion() {
        let pool = open_in_memory().await.unwrap();
        let now = ts("2026-01-01 10:00:00");

        upsert_stats(
            &pool,
            &updates(&[
                (7, "1.1.1.1", "a.com", 1500),  // active client IP
                (7, "2.2.2.2", "a.com", 10),    // below threshold
                (7, "3.3.3.3", "a.com", 5000),  // infrastructure
            ]),
            now,
        )
        .await
        .unwrap();

        rebuild_summaries(&pool, &["3.3.3.3".to_string()]).await.unwrap();

        let user = user_summary(&pool, 7).await.unwrap().unwrap();
        assert_eq!(user.unique_client_ips, 1);
        assert_eq!(user.infrastructure_ips, 1);
    }

    #[tokio::test]
    async fn hourly_row_accumulates_visits() {
        let pool = open_in_memory().await.unwrap();
        let hour = ts("2026-01-01 10:00:00");

        upsert_hourly(&pool, hour, 10, 2, 3).await.unwrap();
        upsert_hourly(&pool, hour, 5, 4, 6).await.unwrap();

        let rows = hourly_stats(&pool, ts("2026-01-01 00:00:00")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].visit_count, 15);
        // Unique counts are refreshed, not summed.
        assert_eq!(rows[0].unique_users, 4);
        assert_eq!(rows[0].unique_destinations, 6);
        assert_eq!(rows[0].server_id, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_stale_rows() {
        let pool = open_in_memory().await.unwrap();
        upsert_stats(
            &pool,
            &updates(&[(1, "1.1.1.1", "old.com", 5)]),
            ts("2024-01-01 00:00:00"),
        )
        .await
        .unwrap();
        upsert_stats(
            &pool,
            &updates(&[(2, "2.2.2.2", "new.com", 5)]),
            ts("2026-01-01 00:00:00"),
        )
        .await
        .unwrap();

        let deleted = cleanup(&pool, ts("2026-01-02 00:00:00"), 365, 365)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM xray_stats")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn period_scoped_queries_hit_fact_table() {
        let pool = open_in_memory().await.unwrap();
        upsert_stats(
            &pool,
            &updates(&[(1, "1.1.1.1", "recent.com", 10)]),
            ts("2026-01-02 00:00:00"),
        )
        .await
        .unwrap();
        upsert_stats(
            &pool,
            &updates(&[(2, "2.2.2.2", "stale.com", 100)]),
            ts("2025-06-01 00:00:00"),
        )
        .await
        .unwrap();

        let tops = top_destinations_since(&pool, ts("2026-01-01 00:00:00"), 10)
            .await
            .unwrap();
        assert_eq!(tops.len(), 1);
        assert_eq!(tops[0].host, "recent.com");

        let users = top_users_since(&pool, ts("2026-01-01 00:00:00"), 10)
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, 1);
    }
}
