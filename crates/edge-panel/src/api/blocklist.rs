//! `/api/blocklist` - rules, external sources, and sync control. Every
//! mutation schedules a background fleet sync.

use super::{ApiResult, PanelState};
use crate::store::blocklist::{self, RuleCreate, SourceCreate};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<PanelState> {
    Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/:id", axum::routing::delete(delete_rule))
        .route("/sources", get(list_sources).post(create_source))
        .route("/sources/:id", axum::routing::delete(delete_source))
        .route("/sources/:id/toggle", post(toggle_source))
        .route("/sources/:id/refresh", post(refresh_source))
        .route("/sources/refresh", post(refresh_all))
        .route("/sync", post(sync_all))
        .route("/sync/:server_id", post(sync_one))
        .route("/sync/status", get(sync_status))
}

async fn list_rules(State(state): State<PanelState>) -> ApiResult<Json<Value>> {
    let rules = blocklist::list_rules(&state.pool).await?;
    Ok(Json(json!({"rules": rules})))
}

async fn create_rule(
    State(state): State<PanelState>,
    Json(request): Json<RuleCreate>,
) -> ApiResult<Json<Value>> {
    let id = blocklist::create_rule(&state.pool, &request).await?;
    state.blocklist.schedule_sync();
    Ok(Json(json!({"id": id, "message": "Rule created, sync scheduled"})))
}

async fn delete_rule(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    blocklist::delete_rule(&state.pool, id).await?;
    state.blocklist.schedule_sync();
    Ok(Json(json!({"message": "Rule deleted, sync scheduled"})))
}

async fn list_sources(State(state): State<PanelState>) -> ApiResult<Json<Value>> {
    let sources = blocklist::list_sources(&state.pool).await?;
    Ok(Json(json!({"sources": sources})))
}

async fn create_source(
    State(state): State<PanelState>,
    Json(request): Json<SourceCreate>,
) -> ApiResult<Json<Value>> {
    let id = blocklist::create_source(&state.pool, &request).await?;
    Ok(Json(json!({"id": id, "message": "Source created"})))
}

async fn delete_source(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    blocklist::delete_source(&state.pool, id).await?;
    state.blocklist.schedule_sync();
    Ok(Json(json!({"message": "Source deleted, sync scheduled"})))
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_source(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
    Json(request): Json<ToggleRequest>,
) -> ApiResult<Json<Value>> {
    blocklist::set_source_enabled(&state.pool, id, request.enabled).await?;
    state.blocklist.clear_cache().await;
    state.blocklist.schedule_sync();
    Ok(Json(json!({"message": "Source updated, sync scheduled"})))
}

async fn refresh_source(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let source = blocklist::get_source(&state.pool, id).await?;
    let (success, message, ip_count, changed) = state.blocklist.refresh_source(&source).await;
    if changed {
        state.blocklist.schedule_sync();
    }
    Ok(Json(json!({
        "success": success,
        "message": message,
        "ip_count": ip_count,
        "changed": changed,
    })))
}

async fn refresh_all(State(state): State<PanelState>) -> Json<Value> {
    let (results, any_changed) = state.blocklist.refresh_all_sources().await;
    if any_changed {
        state.blocklist.clear_cache().await;
        state.blocklist.schedule_sync();
    }
    Json(json!({"results": results, "changed": any_changed}))
}

async fn sync_all(State(state): State<PanelState>) -> Json<Value> {
    Json(state.blocklist.sync_all_nodes().await)
}

async fn sync_one(
    State(state): State<PanelState>,
    Path(server_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.blocklist.sync_single_node(server_id).await?))
}

async fn sync_status(State(state): State<PanelState>) -> Json<Value> {
    Json(state.blocklist.sync_status().await)
}
