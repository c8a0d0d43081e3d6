//! Blocklist rules and external list sources.
//!
//! Removing a source cascades its auto_list rules, keeping the
//! invariant that every `source = 'auto_list'` rule has a live source.

use crate::error::{PanelError, Result};
use chrono::NaiveDateTime;
use edge_types::Direction;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlocklistRule {
    pub id: i64,
    pub ip_cidr: String,
    pub server_id: Option<i64>,
    pub is_permanent: bool,
    pub direction: String,
    pub comment: Option<String>,
    pub source: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleCreate {
    pub ip_cidr: String,
    #[serde(default)]
    pub server_id: Option<i64>,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_direction() -> Direction {
    Direction::In
}

pub async fn list_rules(pool: &SqlitePool) -> Result<Vec<BlocklistRule>> {
    let rows = sqlx::query_as::<_, BlocklistRule>(
        "SELECT id, ip_cidr, server_id, is_permanent, direction, comment, source, created_at \
         FROM blocklist_rules ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn create_rule(pool: &SqlitePool, rule: &RuleCreate) -> Result<i64> {
    let normalized = edge_types::validation::canonicalize_ip(&rule.ip_cidr);
    if !is_valid(&normalized) {
        return Err(PanelError::Validation(format!(
            "Invalid IP/CIDR: {}",
            rule.ip_cidr
        )));
    }
    let result = sqlx::query(
        "INSERT INTO blocklist_rules (ip_cidr, server_id, direction, comment, source) \
         VALUES (?, ?, ?, ?, 'manual')",
    )
    .bind(&normalized)
    .bind(rule.server_id)
    .bind(rule.direction.as_str())
    .bind(&rule.comment)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn delete_rule(pool: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM blocklist_rules WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(PanelError::NotFound(format!("Blocklist rule {}", id)));
    }
    Ok(())
}

/// Global rules: `server_id IS NULL` applies to every server.
pub async fn global_rules(pool: &SqlitePool, direction: Direction) -> Result<Vec<String>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT ip_cidr FROM blocklist_rules \
         WHERE server_id IS NULL AND is_permanent = 1 AND direction = ?",
    )
    .bind(direction.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn server_rules(
    pool: &SqlitePool,
    server_id: i64,
    direction: Direction,
) -> Result<Vec<String>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT ip_cidr FROM blocklist_rules \
         WHERE server_id = ? AND is_permanent = 1 AND direction = ?",
    )
    .bind(server_id)
    .bind(direction.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlocklistSource {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub is_default: bool,
    pub direction: String,
    pub last_updated: Option<NaiveDateTime>,
    pub last_hash: Option<String>,
    pub ip_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceCreate {
    pub name: String,
    pub url: String,
    #[serde(default = "default_direction")]
    pub direction: Direction,
}

const SOURCE_COLUMNS: &str = "id, name, url, enabled, is_default, direction, last_updated, \
    last_hash, ip_count, error_message";

pub async fn list_sources(pool: &SqlitePool) -> Result<Vec<BlocklistSource>> {
    let rows = sqlx::query_as::<_, BlocklistSource>(&format!(
        "SELECT {} FROM blocklist_sources ORDER BY id",
        SOURCE_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn enabled_sources(
    pool: &SqlitePool,
    direction: Direction,
) -> Result<Vec<BlocklistSource>> {
    let rows = sqlx::query_as::<_, BlocklistSource>(&format!(
        "SELECT {} FROM blocklist_sources WHERE enabled = 1 AND direction = ? ORDER BY id",
        SOURCE_COLUMNS
    ))
    .bind(direction.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_source(pool: &SqlitePool, id: i64) -> Result<BlocklistSource> {
    sqlx::query_as::<_, BlocklistSource>(&format!(
        "SELECT {} FROM blocklist_sources WHERE id = ?",
        SOURCE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| PanelError::NotFound(format!("Blocklist source {}", id)))
}

pub async fn create_source(pool: &SqlitePool, source: &SourceCreate) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO blocklist_sources (name, url, direction) VALUES (?, ?, ?)",
    )
    .bind(&source.name)
    .bind(&source.url)
    .bind(source.direction.as_str())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn set_source_enabled(pool: &SqlitePool, id: i64, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE blocklist_sources SET enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(PanelError::NotFound(format!("Blocklist source {}", id)));
    }
    Ok(())
}

/// Deleting a source also drops any auto_list rules it fed.
pub async fn delete_source(pool: &SqlitePool, id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    let deleted = sqlx::query("DELETE FROM blocklist_sources WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(PanelError::NotFound(format!("Blocklist source {}", id)));
    }
    let sources_left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocklist_sources")
        .fetch_one(&mut *tx)
        .await?;
    if sources_left == 0 {
        sqlx::query("DELETE FROM blocklist_rules WHERE source = 'auto_list'")
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn record_refresh(
    pool: &SqlitePool,
    id: i64,
    hash: &str,
    ip_count: i64,
    now: NaiveDateTime,
) -> Result<()> {
    sqlx::query(
        "UPDATE blocklist_sources SET last_hash = ?, ip_count = ?, last_updated = ?, \
         error_message = NULL WHERE id = ?",
    )
    .bind(hash)
    .bind(ip_count)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_refresh_error(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE blocklist_sources SET error_message = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

fn is_valid(ip: &str) -> bool {
    if ip.contains('/') {
        ip.parse::<ipnetwork::IpNetwork>().is_ok()
    } else {
        ip.parse::<std::net::IpAddr>().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    #[tokio::test]
    async fn rules_split_by_scope_and_direction() {
        let pool = open_in_memory().await.unwrap();
        create_rule(
            &pool,
            &RuleCreate {
                ip_cidr: "1.1.1.1".into(),
                server_id: None,
                direction: Direction::In,
                comment: None,
            },
        )
        .await
        .unwrap();
        create_rule(
            &pool,
            &RuleCreate {
                ip_cidr: "2.2.2.2/32".into(),
                server_id: None,
                direction: Direction::Out,
                comment: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(global_rules(&pool, Direction::In).await.unwrap(), vec!["1.1.1.1"]);
        // /32 was normalized to a bare address on insert.
        assert_eq!(
            global_rules(&pool, Direction::Out).await.unwrap(),
            vec!["2.2.2.2"]
        );
    }

    #[tokio::test]
    async fn invalid_rule_rejected() {
        let pool = open_in_memory().await.unwrap();
        let err = create_rule(
            &pool,
            &RuleCreate {
                ip_cidr: "junk".into(),
                server_id: None,
                direction: Direction::In,
                comment: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PanelError::Validation(_)));
    }

    #[tokio::test]
    async fn deleting_last_source_cascades_auto_rules() {
        let pool = open_in_memory().await.unwrap();
        let source_id = create_source(
            &pool,
            &SourceCreate {
                name: "list".into(),
                url: "https://example.com/list.txt".into(),
                direction: Direction::In,
            },
        )
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO blocklist_rules (ip_cidr, direction, source) VALUES ('9.9.9.9', 'in', 'auto_list')",
        )
        .execute(&pool)
        .await
        .unwrap();

        delete_source(&pool, source_id).await.unwrap();
        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM blocklist_rules WHERE source = 'auto_list'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(remaining, 0);
    }
}
