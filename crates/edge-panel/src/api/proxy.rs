//! `/api/proxy/{server_id}/...` - the node surface re-exposed through
//! the panel, plus the cached and historical views the panel maintains.

use super::{ApiError, ApiResult, PanelState};
use crate::error::PanelError;
use crate::store::{metrics, servers};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
const ALLOWED_PREFIXES: &[&str] = &["haproxy/", "ipset/", "traffic/", "remnawave/", "system/"];

pub fn router() -> Router<PanelState> {
    Router::new()
        .route("/:server_id/metrics", get(cached_metrics))
        .route("/:server_id/metrics/live", get(live_metrics))
        .route("/:server_id/metrics/history", get(metrics_history))
        .route("/:server_id/metrics/aggregated", get(aggregated_history))
        .route("/:server_id/haproxy/cached", get(cached_haproxy))
        .route("/:server_id/traffic/cached", get(cached_traffic))
        .route("/:server_id/*path", any(forward))
}

/// Cached metrics blob from the collector's last successful poll.
async fn cached_metrics(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let server = servers::get(&state.pool, server_id).await?;
    let cached: Value = server
        .last_metrics
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);
    Ok(Json(json!({
        "metrics": cached,
        "last_seen": server.last_seen.map(|t| format!("{}Z", t.format("%Y-%m-%dT%H:%M:%S"))),
        "last_error": server.last_error,
        "error_code": server.error_code,
    })))
}

/// Bypass the cache and poll the node right now.
async fn live_metrics(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let server = servers::get(&state.pool, server_id).await?;
    match state.node_client.fetch_metrics(&server).await {
        Ok((doc, _)) => Ok(Json(serde_json::to_value(doc).unwrap_or(Value::Null))),
        Err(poll_error) => Err(ApiError(PanelError::Upstream(poll_error.message))),
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    1
}

async fn metrics_history(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    servers::get(&state.pool, server_id).await?;
    let since = crate::store::now_naive() - chrono::Duration::hours(query.hours.clamp(1, 24));
    let rows = metrics::history(&state.pool, server_id, since).await?;
    let count = rows.len();
    Ok(Json(json!({"history": rows, "count": count})))
}

#[derive(Deserialize)]
struct AggregatedQuery {
    #[serde(default = "default_period")]
    period: String,
    #[serde(default = "default_days")]
    days: i64,
}

fn default_period() -> String {
    "hour".into()
}

fn default_days() -> i64 {
    7
}

async fn aggregated_history(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
    Query(query): Query<AggregatedQuery>,
) -> ApiResult<Json<Value>> {
    servers::get(&state.pool, server_id).await?;
    let period = if query.period == "day" { "day" } else { "hour" };
    let since = crate::store::now_naive() - chrono::Duration::days(query.days.clamp(1, 365));
    let rows = metrics::aggregated_history(&state.pool, server_id, period, since).await?;
    Ok(Json(json!({"history": rows})))
}

async fn cached_haproxy(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let server = servers::get(&state.pool, server_id).await?;
    Ok(Json(
        server
            .last_haproxy_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null),
    ))
}

async fn cached_traffic(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let server = servers::get(&state.pool, server_id).await?;
    Ok(Json(
        server
            .last_traffic_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null),
    ))
}

/// Pass-through to the node's own API, authenticated with the server's
/// stored key.
async fn forward(
    State(state): State<PanelState>,
    Path((server_id, path)): Path<(i64, String)>,
    method: Method,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if !ALLOWED_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return Err(ApiError(PanelError::NotFound(format!("/{}", path))));
    }

    let server = servers::get(&state.pool, server_id).await?;
    let json_body = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| {
            ApiError(PanelError::Validation(format!("Invalid JSON body: {}", e)))
        })?)
    };

    let (status, value) = state
        .node_client
        .forward(&server, method, &format!("/api/{}", path), json_body, FORWARD_TIMEOUT)
        .await?;

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(value)))
}
