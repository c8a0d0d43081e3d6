//! `/api/remnawave` - Xray log ingester status, the panel's stats pull,
//! and torrent-blocker control.

use super::ActionResponse;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use edge_types::XrayCollectReport;
use edge_xray::{BlockerStatus, IngesterStatus};
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/stats/collect", post(collect))
        .route("/torrent-blocker/status", get(blocker_status))
        .route("/torrent-blocker/enable", post(blocker_enable))
        .route("/torrent-blocker/disable", post(blocker_disable))
        .route("/torrent-blocker/threshold", post(blocker_threshold))
        .route("/torrent-blocker/whitelist", post(blocker_whitelist))
}

async fn status(State(state): State<AppState>) -> Json<IngesterStatus> {
    Json(state.ingester.status().await)
}

async fn collect(State(state): State<AppState>) -> ApiResult<Json<XrayCollectReport>> {
    Ok(Json(state.ingester.collect_and_clear().await?))
}

async fn blocker_status(State(state): State<AppState>) -> Json<BlockerStatus> {
    Json(state.blocker.status().await)
}

async fn blocker_enable(State(state): State<AppState>) -> Json<ActionResponse> {
    state.blocker.start().await;
    Json(ActionResponse::ok("Torrent blocker enabled"))
}

async fn blocker_disable(State(state): State<AppState>) -> Json<ActionResponse> {
    state.blocker.disable().await;
    Json(ActionResponse::ok("Torrent blocker disabled"))
}

#[derive(Deserialize)]
struct ThresholdRequest {
    threshold: usize,
}

async fn blocker_threshold(
    State(state): State<AppState>,
    Json(request): Json<ThresholdRequest>,
) -> Json<ActionResponse> {
    state.blocker.set_behavior_threshold(request.threshold).await;
    let applied = state.blocker.behavior_threshold().await;
    Json(ActionResponse::ok(format!(
        "Behavior threshold set to {}",
        applied
    )))
}

#[derive(Deserialize)]
struct WhitelistRequest {
    ips: Vec<String>,
}

async fn blocker_whitelist(
    State(state): State<AppState>,
    Json(request): Json<WhitelistRequest>,
) -> Json<ActionResponse> {
    let count = request.ips.len();
    state.blocker.set_whitelist(request.ips).await;
    Json(ActionResponse::ok(format!(
        "Whitelist updated: {} entries",
        count
    )))
}
