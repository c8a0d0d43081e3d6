//! Metric snapshots and hourly/daily roll-ups.

use crate::error::Result;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

/// One row of derived values ready for insertion. Speeds are already
/// computed from cumulative counters by the collector.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRow {
    pub server_id: i64,
    pub timestamp: NaiveDateTime,
    pub cpu_usage: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub memory_total: i64,
    pub memory_used: i64,
    pub memory_available: i64,
    pub memory_percent: f64,
    pub swap_used: i64,
    pub swap_percent: f64,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub disk_percent: f64,
    pub disk_read_bytes_per_sec: f64,
    pub disk_write_bytes_per_sec: f64,
    pub process_count: i64,
    pub connections_count: i64,
    pub tcp_established: Option<i64>,
    pub tcp_listen: Option<i64>,
    pub tcp_time_wait: Option<i64>,
    pub tcp_close_wait: Option<i64>,
    pub tcp_syn_sent: Option<i64>,
    pub tcp_syn_recv: Option<i64>,
    pub tcp_fin_wait: Option<i64>,
    pub per_cpu_percent: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SnapshotOut {
    pub timestamp: NaiveDateTime,
    pub cpu_usage: Option<f64>,
    pub memory_percent: Option<f64>,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
    pub disk_percent: Option<f64>,
    pub tcp_established: Option<i64>,
    pub connections_count: Option<i64>,
}

pub async fn insert_snapshot(pool: &SqlitePool, row: &SnapshotRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO metrics_snapshots (
            server_id, timestamp, cpu_usage, load_avg_1, load_avg_5, load_avg_15,
            memory_total, memory_used, memory_available, memory_percent,
            swap_used, swap_percent,
            net_rx_bytes_per_sec, net_tx_bytes_per_sec, net_rx_bytes, net_tx_bytes,
            disk_percent, disk_read_bytes_per_sec, disk_write_bytes_per_sec,
            process_count, connections_count,
            tcp_established, tcp_listen, tcp_time_wait, tcp_close_wait,
            tcp_syn_sent, tcp_syn_recv, tcp_fin_wait, per_cpu_percent
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.server_id)
    .bind(row.timestamp)
    .bind(row.cpu_usage)
    .bind(row.load_avg_1)
    .bind(row.load_avg_5)
    .bind(row.load_avg_15)
    .bind(row.memory_total)
    .bind(row.memory_used)
    .bind(row.memory_available)
    .bind(row.memory_percent)
    .bind(row.swap_used)
    .bind(row.swap_percent)
    .bind(row.net_rx_bytes_per_sec)
    .bind(row.net_tx_bytes_per_sec)
    .bind(row.net_rx_bytes)
    .bind(row.net_tx_bytes)
    .bind(row.disk_percent)
    .bind(row.disk_read_bytes_per_sec)
    .bind(row.disk_write_bytes_per_sec)
    .bind(row.process_count)
    .bind(row.connections_count)
    .bind(row.tcp_established)
    .bind(row.tcp_listen)
    .bind(row.tcp_time_wait)
    .bind(row.tcp_close_wait)
    .bind(row.tcp_syn_sent)
    .bind(row.tcp_syn_recv)
    .bind(row.tcp_fin_wait)
    .bind(&row.per_cpu_percent)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn history(
    pool: &SqlitePool,
    server_id: i64,
    since: NaiveDateTime,
) -> Result<Vec<SnapshotOut>> {
    let rows = sqlx::query_as::<_, SnapshotOut>(
        "SELECT timestamp, cpu_usage, memory_percent, net_rx_bytes_per_sec, \
         net_tx_bytes_per_sec, disk_percent, tcp_established, connections_count \
         FROM metrics_snapshots WHERE server_id = ? AND timestamp >= ? ORDER BY timestamp",
    )
    .bind(server_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Close out one hour of raw snapshots into a single aggregated row.
/// Idempotent: an existing row for the (server, hour) is left alone.
pub async fn aggregate_hour(
    pool: &SqlitePool,
    server_id: i64,
    hour_start: NaiveDateTime,
) -> Result<bool> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM aggregated_metrics WHERE server_id = ? AND period_type = 'hour' AND timestamp = ?",
    )
    .bind(server_id)
    .bind(hour_start)
    .fetch_optional(pool)
    .await?;
    if exists.is_some() {
        return Ok(false);
    }

    let hour_end = hour_start + Duration::hours(1);
    let inserted = sqlx::query(
        r#"
        INSERT INTO aggregated_metrics (
            server_id, timestamp, period_type,
            avg_cpu, max_cpu, avg_load, avg_memory_percent, max_memory_percent,
            avg_disk_percent, total_rx_bytes, total_tx_bytes, avg_rx_speed, avg_tx_speed,
            avg_disk_read_speed, avg_disk_write_speed,
            avg_tcp_established, avg_tcp_listen, avg_tcp_time_wait, avg_tcp_close_wait,
            avg_tcp_syn_sent, avg_tcp_syn_recv, avg_tcp_fin_wait, data_points
        )
        SELECT
            ?, ?, 'hour',
            COALESCE(AVG(cpu_usage), 0), COALESCE(MAX(cpu_usage), 0), COALESCE(AVG(load_avg_1), 0),
            COALESCE(AVG(memory_percent), 0), COALESCE(MAX(memory_percent), 0),
            COALESCE(AVG(disk_percent), 0),
            CAST(COALESCE(SUM(net_rx_bytes_per_sec * 5), 0) AS INTEGER),
            CAST(COALESCE(SUM(net_tx_bytes_per_sec * 5), 0) AS INTEGER),
            COALESCE(AVG(net_rx_bytes_per_sec), 0), COALESCE(AVG(net_tx_bytes_per_sec), 0),
            COALESCE(AVG(disk_read_bytes_per_sec), 0), COALESCE(AVG(disk_write_bytes_per_sec), 0),
            AVG(tcp_established), AVG(tcp_listen), AVG(tcp_time_wait), AVG(tcp_close_wait),
            AVG(tcp_syn_sent), AVG(tcp_syn_recv), AVG(tcp_fin_wait),
            COUNT(*)
        FROM metrics_snapshots
        WHERE server_id = ? AND timestamp >= ? AND timestamp < ?
        HAVING COUNT(*) > 0
        "#,
    )
    .bind(server_id)
    .bind(hour_start)
    .bind(server_id)
    .bind(hour_start)
    .bind(hour_end)
    .execute(pool)
    .await?;

    Ok(inserted.rows_affected() > 0)
}

/// Roll hourly rows for one day up into a daily row.
pub async fn aggregate_day(
    pool: &SqlitePool,
    server_id: i64,
    day_start: NaiveDateTime,
) -> Result<bool> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM aggregated_metrics WHERE server_id = ? AND period_type = 'day' AND timestamp = ?",
    )
    .bind(server_id)
    .bind(day_start)
    .fetch_optional(pool)
    .await?;
    if exists.is_some() {
        return Ok(false);
    }

    let day_end = day_start + Duration::days(1);
    let inserted = sqlx::query(
        r#"
        INSERT INTO aggregated_metrics (
            server_id, timestamp, period_type,
            avg_cpu, max_cpu, avg_load, avg_memory_percent, max_memory_percent,
            avg_disk_percent, total_rx_bytes, total_tx_bytes, avg_rx_speed, avg_tx_speed,
            avg_disk_read_speed, avg_disk_write_speed,
            avg_tcp_established, avg_tcp_listen, avg_tcp_time_wait, avg_tcp_close_wait,
            avg_tcp_syn_sent, avg_tcp_syn_recv, avg_tcp_fin_wait, data_points
        )
        SELECT
            ?, ?, 'day',
            COALESCE(AVG(avg_cpu), 0), COALESCE(MAX(max_cpu), 0), COALESCE(AVG(avg_load), 0),
            COALESCE(AVG(avg_memory_percent), 0), COALESCE(MAX(max_memory_percent), 0),
            COALESCE(AVG(avg_disk_percent), 0),
            COALESCE(SUM(total_rx_bytes), 0), COALESCE(SUM(total_tx_bytes), 0),
            COALESCE(AVG(avg_rx_speed), 0), COALESCE(AVG(avg_tx_speed), 0),
            COALESCE(AVG(avg_disk_read_speed), 0), COALESCE(AVG(avg_disk_write_speed), 0),
            AVG(avg_tcp_established), AVG(avg_tcp_listen), AVG(avg_tcp_time_wait),
            AVG(avg_tcp_close_wait), AVG(avg_tcp_syn_sent), AVG(avg_tcp_syn_recv),
            AVG(avg_tcp_fin_wait),
            COALESCE(SUM(data_points), 0)
        FROM aggregated_metrics
        WHERE server_id = ? AND period_type = 'hour' AND timestamp >= ? AND timestamp < ?
        HAVING COUNT(*) > 0
        "#,
    )
    .bind(server_id)
    .bind(day_start)
    .bind(server_id)
    .bind(day_start)
    .bind(day_end)
    .execute(pool)
    .await?;

    Ok(inserted.rows_affected() > 0)
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AggregatedOut {
    pub timestamp: NaiveDateTime,
    pub period_type: String,
    pub avg_cpu: Option<f64>,
    pub max_cpu: Option<f64>,
    pub avg_memory_percent: Option<f64>,
    pub max_memory_percent: Option<f64>,
    pub avg_disk_percent: Option<f64>,
    pub total_rx_bytes: i64,
    pub total_tx_bytes: i64,
    pub avg_rx_speed: f64,
    pub avg_tx_speed: f64,
    pub data_points: i64,
}

pub async fn aggregated_history(
    pool: &SqlitePool,
    server_id: i64,
    period_type: &str,
    since: NaiveDateTime,
) -> Result<Vec<AggregatedOut>> {
    let rows = sqlx::query_as::<_, AggregatedOut>(
        "SELECT timestamp, period_type, avg_cpu, max_cpu, avg_memory_percent, \
         max_memory_percent, avg_disk_percent, total_rx_bytes, total_tx_bytes, \
         avg_rx_speed, avg_tx_speed, data_points \
         FROM aggregated_metrics \
         WHERE server_id = ? AND period_type = ? AND timestamp >= ? ORDER BY timestamp",
    )
    .bind(server_id)
    .bind(period_type)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Enforce retention: raw > 24 h, hourly > 30 d, daily > 365 d.
pub async fn cleanup(pool: &SqlitePool, now: NaiveDateTime) -> Result<()> {
    sqlx::query("DELETE FROM metrics_snapshots WHERE timestamp < ?")
        .bind(now - Duration::hours(24))
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM aggregated_metrics WHERE period_type = 'hour' AND timestamp < ?")
        .bind(now - Duration::days(30))
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM aggregated_metrics WHERE period_type = 'day' AND timestamp < ?")
        .bind(now - Duration::days(365))
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{open_in_memory, servers};

    async fn seed_server(pool: &SqlitePool) -> i64 {
        servers::create(
            pool,
            &servers::ServerCreate {
                name: "s".into(),
                url: "http://s".into(),
                api_key: "k".into(),
                folder: None,
            },
        )
        .await
        .unwrap()
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[tokio::test]
    async fn hourly_aggregation_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        let server_id = seed_server(&pool).await;

        for minute in [0, 10, 20] {
            let mut row = SnapshotRow {
                server_id,
                timestamp: ts(&format!("2026-01-01 10:{:02}:00", minute)),
                cpu_usage: 30.0 + minute as f64,
                ..Default::default()
            };
            row.memory_percent = 50.0;
            insert_snapshot(&pool, &row).await.unwrap();
        }

        let hour = ts("2026-01-01 10:00:00");
        assert!(aggregate_hour(&pool, server_id, hour).await.unwrap());
        assert!(!aggregate_hour(&pool, server_id, hour).await.unwrap());

        let rows = aggregated_history(&pool, server_id, "hour", ts("2026-01-01 00:00:00"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data_points, 3);
        assert!((rows[0].avg_cpu.unwrap() - 40.0).abs() < 1e-9);
        assert!((rows[0].max_cpu.unwrap() - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn daily_rolls_up_hourly() {
        let pool = open_in_memory().await.unwrap();
        let server_id = seed_server(&pool).await;

        for hour in [3, 4] {
            let row = SnapshotRow {
                server_id,
                timestamp: ts(&format!("2026-01-01 {:02}:05:00", hour)),
                cpu_usage: 20.0,
                net_rx_bytes_per_sec: 100.0,
                ..Default::default()
            };
            insert_snapshot(&pool, &row).await.unwrap();
            assert!(aggregate_hour(
                &pool,
                server_id,
                ts(&format!("2026-01-01 {:02}:00:00", hour))
            )
            .await
            .unwrap());
        }

        assert!(aggregate_day(&pool, server_id, ts("2026-01-01 00:00:00"))
            .await
            .unwrap());
        let days = aggregated_history(&pool, server_id, "day", ts("2026-01-01 00:00:00"))
            .await
            .unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].data_points, 2);
        assert_eq!(days[0].total_rx_bytes, 1000); // 2 hours x 100 B/s x 5 s
    }

    #[tokio::test]
    async fn retention_deletes_old_rows() {
        let pool = open_in_memory().await.unwrap();
        let server_id = seed_server(&pool).await;

        let old = SnapshotRow {
            server_id,
            timestamp: ts("2026-01-01 00:00:00"),
            ..Default::default()
        };
        let fresh = SnapshotRow {
            server_id,
            timestamp: ts("2026-01-02 23:30:00"),
            ..Default::default()
        };
        insert_snapshot(&pool, &old).await.unwrap();
        insert_snapshot(&pool, &fresh).await.unwrap();

        cleanup(&pool, ts("2026-01-03 00:00:00")).await.unwrap();
        let rows = history(&pool, server_id, ts("2025-01-01 00:00:00"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, fresh.timestamp);
    }
}
