//! Server registry: operator CRUD plus the collector's cache columns.

use crate::error::{PanelError, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub position: i64,
    pub is_active: bool,
    pub folder: Option<String>,
    pub last_seen: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub error_code: Option<i64>,
    #[serde(skip_serializing)]
    pub last_metrics: Option<String>,
    #[serde(skip_serializing)]
    pub last_haproxy_data: Option<String>,
    #[serde(skip_serializing)]
    pub last_traffic_data: Option<String>,
    pub has_xray_node: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerCreate {
    pub name: String,
    pub url: String,
    pub api_key: String,
    #[serde(default)]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub is_active: Option<bool>,
    pub folder: Option<String>,
}

const SELECT_COLUMNS: &str = "id, name, url, api_key, position, is_active, folder, last_seen, \
    last_error, error_code, last_metrics, last_haproxy_data, last_traffic_data, has_xray_node";

pub async fn list(pool: &SqlitePool) -> Result<Vec<Server>> {
    let rows = sqlx::query_as::<_, Server>(&format!(
        "SELECT {} FROM servers ORDER BY position, id",
        SELECT_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_active(pool: &SqlitePool) -> Result<Vec<Server>> {
    let rows = sqlx::query_as::<_, Server>(&format!(
        "SELECT {} FROM servers WHERE is_active = 1 ORDER BY position, id",
        SELECT_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Server> {
    sqlx::query_as::<_, Server>(&format!(
        "SELECT {} FROM servers WHERE id = ?",
        SELECT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| PanelError::NotFound(format!("Server {}", id)))
}

pub async fn create(pool: &SqlitePool, server: &ServerCreate) -> Result<i64> {
    let position: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) + 1 FROM servers")
        .fetch_one(pool)
        .await?;
    let result = sqlx::query(
        "INSERT INTO servers (name, url, api_key, position, folder) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&server.name)
    .bind(server.url.trim_end_matches('/'))
    .bind(&server.api_key)
    .bind(position)
    .bind(&server.folder)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn update(pool: &SqlitePool, id: i64, update: &ServerUpdate) -> Result<()> {
    let existing = get(pool, id).await?;
    sqlx::query(
        "UPDATE servers SET name = ?, url = ?, api_key = ?, is_active = ?, folder = ?, \
         updated_at = datetime('now') WHERE id = ?",
    )
    .bind(update.name.as_ref().unwrap_or(&existing.name))
    .bind(
        update
            .url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or(&existing.url),
    )
    .bind(update.api_key.as_ref().unwrap_or(&existing.api_key))
    .bind(update.is_active.unwrap_or(existing.is_active))
    .bind(update.folder.as_ref().or(existing.folder.as_ref()))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM servers WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(PanelError::NotFound(format!("Server {}", id)));
    }
    Ok(())
}

pub async fn reorder(pool: &SqlitePool, ordered_ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (position, id) in ordered_ids.iter().enumerate() {
        sqlx::query("UPDATE servers SET position = ? WHERE id = ?")
            .bind(position as i64)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn move_to_folder(
    pool: &SqlitePool,
    ids: &[i64],
    folder: Option<&str>,
) -> Result<()> {
    for id in ids {
        sqlx::query("UPDATE servers SET folder = ? WHERE id = ?")
            .bind(folder)
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub async fn rename_folder(pool: &SqlitePool, from: &str, to: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE servers SET folder = ? WHERE folder = ?")
        .bind(to)
        .bind(from)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn clear_folder(pool: &SqlitePool, folder: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE servers SET folder = NULL WHERE folder = ?")
        .bind(folder)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn mark_online(
    pool: &SqlitePool,
    id: i64,
    metrics_json: &str,
    now: NaiveDateTime,
) -> Result<()> {
    sqlx::query(
        "UPDATE servers SET last_seen = ?, last_error = NULL, error_code = NULL, last_metrics = ? \
         WHERE id = ?",
    )
    .bind(now)
    .bind(metrics_json)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_error(pool: &SqlitePool, id: i64, message: &str, code: i64) -> Result<()> {
    sqlx::query("UPDATE servers SET last_error = ?, error_code = ? WHERE id = ?")
        .bind(message)
        .bind(code)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn cache_haproxy_data(pool: &SqlitePool, id: i64, json: &str) -> Result<()> {
    sqlx::query("UPDATE servers SET last_haproxy_data = ? WHERE id = ?")
        .bind(json)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn cache_traffic_data(pool: &SqlitePool, id: i64, json: &str) -> Result<()> {
    sqlx::query("UPDATE servers SET last_traffic_data = ? WHERE id = ?")
        .bind(json)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_has_xray_node(pool: &SqlitePool, id: i64, value: bool) -> Result<()> {
    sqlx::query("UPDATE servers SET has_xray_node = ? WHERE id = ?")
        .bind(value)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn sample() -> ServerCreate {
        ServerCreate {
            name: "edge-1".into(),
            url: "https://edge-1.example.com:8081/".into(),
            api_key: "key".into(),
            folder: None,
        }
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let pool = open_in_memory().await.unwrap();
        let id = create(&pool, &sample()).await.unwrap();

        let server = get(&pool, id).await.unwrap();
        assert_eq!(server.name, "edge-1");
        // Trailing slash is normalized away.
        assert_eq!(server.url, "https://edge-1.example.com:8081");
        assert!(server.is_active);

        update(
            &pool,
            id,
            &ServerUpdate {
                name: Some("renamed".into()),
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let server = get(&pool, id).await.unwrap();
        assert_eq!(server.name, "renamed");
        assert!(!server.is_active);
        assert!(list_active(&pool).await.unwrap().is_empty());

        delete(&pool, id).await.unwrap();
        assert!(get(&pool, id).await.is_err());
    }

    #[tokio::test]
    async fn reorder_rewrites_positions() {
        let pool = open_in_memory().await.unwrap();
        let a = create(&pool, &sample()).await.unwrap();
        let mut second = sample();
        second.name = "edge-2".into();
        second.url = "https://edge-2.example.com".into();
        let b = create(&pool, &second).await.unwrap();

        reorder(&pool, &[b, a]).await.unwrap();
        let servers = list(&pool).await.unwrap();
        assert_eq!(servers[0].id, b);
        assert_eq!(servers[1].id, a);
    }
}
