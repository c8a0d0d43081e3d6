//! `/api/remnawave` - aggregator control, stats queries and the batch
//! endpoint that collapses the dashboard's three top-level queries into
//! one round-trip.

use super::{ApiResult, PanelState};
use crate::remnawave::UpstreamClient;
use crate::store::{settings, xray};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<PanelState> {
    Router::new()
        .route("/settings", get(get_settings).put(update_settings))
        .route("/settings/check-connection", post(check_connection))
        .route("/status", get(status))
        .route("/nodes/:server_id", post(set_node))
        .route("/stats/collect-now", post(collect_now))
        .route("/stats/global", get(global_stats))
        .route("/stats/top-users", get(top_users))
        .route("/stats/top-destinations", get(top_destinations))
        .route("/stats/users/:email", get(user_stats))
        .route("/stats/hourly", get(hourly))
        .route("/stats/batch", get(batch))
        .route("/user-cache/refresh", post(refresh_user_cache))
        .route("/user-cache/status", get(user_cache_status))
}

async fn get_settings(State(state): State<PanelState>) -> ApiResult<Json<Value>> {
    let settings = settings::remnawave_settings(&state.pool).await?;
    // The token is write-only through the API.
    Ok(Json(json!({
        "enabled": settings.enabled,
        "api_url": settings.api_url,
        "api_token_set": settings.api_token.as_deref().map(|t| !t.is_empty()).unwrap_or(false),
        "collection_interval": settings.collection_interval,
        "ignored_user_ids": settings.ignored_user_ids,
        "visit_stats_retention_days": settings.visit_stats_retention_days,
        "hourly_stats_retention_days": settings.hourly_stats_retention_days,
    })))
}

#[derive(Deserialize)]
struct SettingsUpdate {
    enabled: Option<bool>,
    api_url: Option<String>,
    api_token: Option<String>,
    cookie_secret: Option<String>,
    collection_interval: Option<i64>,
    ignored_user_ids: Option<String>,
    visit_stats_retention_days: Option<i64>,
    hourly_stats_retention_days: Option<i64>,
}

async fn update_settings(
    State(state): State<PanelState>,
    Json(request): Json<SettingsUpdate>,
) -> ApiResult<Json<Value>> {
    let mut settings = settings::remnawave_settings(&state.pool).await?;
    if let Some(enabled) = request.enabled {
        settings.enabled = enabled;
    }
    if let Some(api_url) = request.api_url {
        settings.api_url = Some(api_url);
    }
    if let Some(api_token) = request.api_token {
        settings.api_token = Some(api_token);
    }
    if let Some(cookie_secret) = request.cookie_secret {
        settings.cookie_secret = Some(cookie_secret);
    }
    if let Some(interval) = request.collection_interval {
        settings.collection_interval = interval.clamp(60, 900);
    }
    if let Some(ignored) = request.ignored_user_ids {
        settings.ignored_user_ids = Some(ignored);
    }
    if let Some(days) = request.visit_stats_retention_days {
        settings.visit_stats_retention_days = days.max(1);
    }
    if let Some(days) = request.hourly_stats_retention_days {
        settings.hourly_stats_retention_days = days.max(1);
    }
    settings::save_remnawave_settings(&state.pool, &settings).await?;
    Ok(Json(json!({"message": "Settings updated"})))
}

async fn check_connection(State(state): State<PanelState>) -> ApiResult<Json<Value>> {
    let settings = settings::remnawave_settings(&state.pool).await?;
    let client = UpstreamClient::new(
        settings.api_url.as_deref().unwrap_or(""),
        settings.api_token.as_deref().unwrap_or(""),
        settings.cookie_secret.as_deref(),
    )?;
    let check = client.check_connection().await;
    Ok(Json(json!({
        "url": check.url,
        "api_reachable": check.api_reachable,
        "auth_valid": check.auth_valid,
        "error": check.error,
    })))
}

async fn status(State(state): State<PanelState>) -> Json<Value> {
    Json(state.aggregator.status().await)
}

#[derive(Deserialize)]
struct NodeToggle {
    enabled: bool,
}

async fn set_node(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
    Json(request): Json<NodeToggle>,
) -> ApiResult<Json<Value>> {
    crate::store::servers::get(&state.pool, server_id).await?;
    settings::ensure_node(&state.pool, server_id, request.enabled).await?;
    Ok(Json(json!({"message": "Node updated"})))
}

async fn collect_now(State(state): State<PanelState>) -> Json<Value> {
    Json(state.aggregator.collect_now().await)
}

async fn global_stats(State(state): State<PanelState>) -> ApiResult<Json<Value>> {
    let summary = xray::global_summary(&state.pool).await?;
    Ok(Json(serde_json::to_value(summary).unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
struct TopQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    /// Window in hours; absent means all time (served from the
    /// projections).
    #[serde(default)]
    period_hours: Option<i64>,
}

fn default_limit() -> i64 {
    100
}

async fn top_users(
    State(state): State<PanelState>,
    Query(query): Query<TopQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.clamp(1, 1000);
    let users = match query.period_hours {
        Some(hours) => {
            let cutoff = crate::store::now_naive() - chrono::Duration::hours(hours.max(1));
            xray::top_users_since(&state.pool, cutoff, limit).await?
        }
        None => xray::top_users(&state.pool, limit).await?,
    };
    Ok(Json(json!({"users": users})))
}

async fn top_destinations(
    State(state): State<PanelState>,
    Query(query): Query<TopQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.clamp(1, 1000);
    let destinations = match query.period_hours {
        Some(hours) => {
            let cutoff = crate::store::now_naive() - chrono::Duration::hours(hours.max(1));
            xray::top_destinations_since(&state.pool, cutoff, limit).await?
        }
        None => xray::top_destinations(&state.pool, limit).await?,
    };
    Ok(Json(json!({"destinations": destinations})))
}

async fn user_stats(
    State(state): State<PanelState>,
    Path(email): Path<i64>,
) -> ApiResult<Json<Value>> {
    let summary = xray::user_summary(&state.pool, email).await?;
    Ok(Json(json!({"user": summary})))
}

#[derive(Deserialize)]
struct HourlyQuery {
    #[serde(default = "default_hourly_hours")]
    hours: i64,
}

fn default_hourly_hours() -> i64 {
    24
}

async fn hourly(
    State(state): State<PanelState>,
    Query(query): Query<HourlyQuery>,
) -> ApiResult<Json<Value>> {
    let since = crate::store::now_naive() - chrono::Duration::hours(query.hours.clamp(1, 24 * 30));
    let rows = xray::hourly_stats(&state.pool, since).await?;
    Ok(Json(json!({"hourly": rows})))
}

/// One round-trip for the dashboard: global summary + top users + top
/// destinations.
async fn batch(
    State(state): State<PanelState>,
    Query(query): Query<TopQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.clamp(1, 1000);
    // The default shape is pre-computed after every collection cycle.
    if query.period_hours.is_none() && limit == 100 {
        if let Some(cached) = state.aggregator.cached_batch().await {
            return Ok(Json(cached));
        }
    }
    let global = xray::global_summary(&state.pool).await?;
    let (users, destinations) = match query.period_hours {
        Some(hours) => {
            let cutoff = crate::store::now_naive() - chrono::Duration::hours(hours.max(1));
            (
                xray::top_users_since(&state.pool, cutoff, limit).await?,
                xray::top_destinations_since(&state.pool, cutoff, limit).await?,
            )
        }
        None => (
            xray::top_users(&state.pool, limit).await?,
            xray::top_destinations(&state.pool, limit).await?,
        ),
    };
    Ok(Json(json!({
        "global": global,
        "top_users": users,
        "top_destinations": destinations,
    })))
}

async fn refresh_user_cache(State(state): State<PanelState>) -> Json<Value> {
    Json(state.aggregator.update_user_cache().await)
}

async fn user_cache_status(State(state): State<PanelState>) -> Json<Value> {
    Json(state.aggregator.user_cache_status().await)
}
