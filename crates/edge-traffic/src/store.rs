//! SQLite storage for the traffic time series.
//!
//! Raw per-tick deltas land in `interface_traffic` / `port_traffic`;
//! hourly, daily and monthly rows accumulate via upsert. The roll-up
//! tables key on (period, interface, port) with `''`/`0` sentinels for
//! the unused dimension so the upsert conflict target stays total.

use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct PeriodTraffic {
    pub period: String,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortTotals {
    pub port: u16,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceTotals {
    pub interface: String,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalTraffic {
    pub rx_bytes: i64,
    pub tx_bytes: i64,
    pub days: i64,
}

pub async fn open(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interface_traffic (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            interface TEXT NOT NULL,
            rx_bytes INTEGER NOT NULL,
            tx_bytes INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_iface_ts ON interface_traffic(timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_iface_name ON interface_traffic(interface)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS port_traffic (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL DEFAULT 'tcp',
            rx_bytes INTEGER NOT NULL,
            tx_bytes INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_port_ts ON port_traffic(timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_port_num ON port_traffic(port)")
        .execute(pool)
        .await?;

    for (table, period_col) in [
        ("hourly_traffic", "hour"),
        ("daily_traffic", "date"),
        ("monthly_traffic", "month"),
    ] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                {period_col} TEXT NOT NULL,
                interface TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL DEFAULT 0,
                rx_bytes INTEGER NOT NULL,
                tx_bytes INTEGER NOT NULL,
                UNIQUE({period_col}, interface, port)
            )
            "#,
        ))
        .execute(pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_{period_col} ON {table}({period_col})"
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn record_interface_delta(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    interface: &str,
    rx_delta: i64,
    tx_delta: i64,
) -> Result<()> {
    let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    sqlx::query(
        "INSERT INTO interface_traffic (timestamp, interface, rx_bytes, tx_bytes) VALUES (?, ?, ?, ?)",
    )
    .bind(&timestamp)
    .bind(interface)
    .bind(rx_delta)
    .bind(tx_delta)
    .execute(pool)
    .await?;

    accumulate(pool, now, Some(interface), 0, rx_delta, tx_delta).await
}

pub async fn record_port_delta(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    port: u16,
    rx_delta: i64,
    tx_delta: i64,
) -> Result<()> {
    let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    sqlx::query("INSERT INTO port_traffic (timestamp, port, rx_bytes, tx_bytes) VALUES (?, ?, ?, ?)")
        .bind(&timestamp)
        .bind(port as i64)
        .bind(rx_delta)
        .bind(tx_delta)
        .execute(pool)
        .await?;

    accumulate(pool, now, None, port, rx_delta, tx_delta).await
}

async fn accumulate(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    interface: Option<&str>,
    port: u16,
    rx_delta: i64,
    tx_delta: i64,
) -> Result<()> {
    let interface = interface.unwrap_or("");
    let buckets = [
        ("hourly_traffic", "hour", now.format("%Y-%m-%d %H:00").to_string()),
        ("daily_traffic", "date", now.format("%Y-%m-%d").to_string()),
        ("monthly_traffic", "month", now.format("%Y-%m").to_string()),
    ];

    for (table, period_col, bucket) in buckets {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} ({period_col}, interface, port, rx_bytes, tx_bytes)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT({period_col}, interface, port) DO UPDATE SET
                rx_bytes = rx_bytes + excluded.rx_bytes,
                tx_bytes = tx_bytes + excluded.tx_bytes
            "#,
        ))
        .bind(&bucket)
        .bind(interface)
        .bind(port as i64)
        .bind(rx_delta)
        .bind(tx_delta)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Delete raw rows older than the retention window. Roll-ups are kept.
pub async fn cleanup_raw(pool: &SqlitePool, retention_days: i64) -> Result<()> {
    let cutoff = (Utc::now() - Duration::days(retention_days))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    sqlx::query("DELETE FROM interface_traffic WHERE timestamp < ?")
        .bind(&cutoff)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM port_traffic WHERE timestamp < ?")
        .bind(&cutoff)
        .execute(pool)
        .await?;
    Ok(())
}

async fn period_series(
    pool: &SqlitePool,
    table: &str,
    period_col: &str,
    cutoff: &str,
    interface: Option<&str>,
    port: Option<u16>,
) -> Result<Vec<PeriodTraffic>> {
    let rows = if let Some(interface) = interface {
        sqlx::query(&format!(
            "SELECT {period_col}, rx_bytes, tx_bytes FROM {table} WHERE {period_col} >= ? AND interface = ? AND port = 0 ORDER BY {period_col}"
        ))
        .bind(cutoff)
        .bind(interface)
        .fetch_all(pool)
        .await?
    } else if let Some(port) = port {
        sqlx::query(&format!(
            "SELECT {period_col}, rx_bytes, tx_bytes FROM {table} WHERE {period_col} >= ? AND port = ? ORDER BY {period_col}"
        ))
        .bind(cutoff)
        .bind(port as i64)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query(&format!(
            "SELECT {period_col}, SUM(rx_bytes), SUM(tx_bytes) FROM {table} WHERE {period_col} >= ? AND port = 0 GROUP BY {period_col} ORDER BY {period_col}"
        ))
        .bind(cutoff)
        .fetch_all(pool)
        .await?
    };

    Ok(rows
        .into_iter()
        .map(|row| PeriodTraffic {
            period: row.get::<String, _>(0),
            rx_bytes: row.get::<Option<i64>, _>(1).unwrap_or(0),
            tx_bytes: row.get::<Option<i64>, _>(2).unwrap_or(0),
        })
        .collect())
}

pub async fn hourly(
    pool: &SqlitePool,
    hours: i64,
    interface: Option<&str>,
    port: Option<u16>,
) -> Result<Vec<PeriodTraffic>> {
    let cutoff = (Utc::now() - Duration::hours(hours))
        .format("%Y-%m-%d %H:00")
        .to_string();
    period_series(pool, "hourly_traffic", "hour", &cutoff, interface, port).await
}

pub async fn daily(
    pool: &SqlitePool,
    days: i64,
    interface: Option<&str>,
    port: Option<u16>,
) -> Result<Vec<PeriodTraffic>> {
    let cutoff = (Utc::now() - Duration::days(days))
        .format("%Y-%m-%d")
        .to_string();
    period_series(pool, "daily_traffic", "date", &cutoff, interface, port).await
}

pub async fn monthly(
    pool: &SqlitePool,
    months: i64,
    interface: Option<&str>,
    port: Option<u16>,
) -> Result<Vec<PeriodTraffic>> {
    let cutoff = (Utc::now() - Duration::days(months * 30))
        .format("%Y-%m")
        .to_string();
    period_series(pool, "monthly_traffic", "month", &cutoff, interface, port).await
}

pub async fn port_summary(pool: &SqlitePool, days: i64) -> Result<Vec<PortTotals>> {
    let cutoff = (Utc::now() - Duration::days(days))
        .format("%Y-%m-%d")
        .to_string();
    let rows = sqlx::query(
        "SELECT port, SUM(rx_bytes), SUM(tx_bytes) FROM daily_traffic WHERE date >= ? AND port != 0 GROUP BY port ORDER BY port",
    )
    .bind(&cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| PortTotals {
            port: row.get::<i64, _>(0) as u16,
            rx_bytes: row.get::<Option<i64>, _>(1).unwrap_or(0),
            tx_bytes: row.get::<Option<i64>, _>(2).unwrap_or(0),
        })
        .collect())
}

pub async fn interface_summary(pool: &SqlitePool, days: i64) -> Result<Vec<InterfaceTotals>> {
    let cutoff = (Utc::now() - Duration::days(days))
        .format("%Y-%m-%d")
        .to_string();
    let rows = sqlx::query(
        "SELECT interface, SUM(rx_bytes), SUM(tx_bytes) FROM daily_traffic WHERE date >= ? AND interface != '' AND port = 0 GROUP BY interface ORDER BY interface",
    )
    .bind(&cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| InterfaceTotals {
            interface: row.get::<String, _>(0),
            rx_bytes: row.get::<Option<i64>, _>(1).unwrap_or(0),
            tx_bytes: row.get::<Option<i64>, _>(2).unwrap_or(0),
        })
        .collect())
}

pub async fn total_traffic(pool: &SqlitePool, days: i64) -> Result<TotalTraffic> {
    let cutoff = (Utc::now() - Duration::days(days))
        .format("%Y-%m-%d")
        .to_string();
    let row = sqlx::query(
        "SELECT SUM(rx_bytes), SUM(tx_bytes) FROM daily_traffic WHERE date >= ? AND port = 0",
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await?;
    Ok(TotalTraffic {
        rx_bytes: row.get::<Option<i64>, _>(0).unwrap_or(0),
        tx_bytes: row.get::<Option<i64>, _>(1).unwrap_or(0),
        days,
    })
}
