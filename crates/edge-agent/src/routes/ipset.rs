//! `/api/ipset` - blocklist set management and the panel-driven sync.

use super::ActionResponse;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use edge_types::{Direction, IpsetStatus, IpsetSyncRequest};
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/list", get(list))
        .route("/add", post(add))
        .route("/remove", post(remove))
        .route("/bulk-add", post(bulk_add))
        .route("/bulk-remove", post(bulk_remove))
        .route("/sync", post(sync))
        .route("/clear", post(clear))
        .route("/timeout", post(set_timeout))
}

fn default_permanent() -> bool {
    true
}

fn default_direction() -> Direction {
    Direction::In
}

#[derive(Deserialize)]
struct SetSelector {
    #[serde(default = "default_permanent")]
    permanent: bool,
    #[serde(default = "default_direction")]
    direction: Direction,
}

async fn status(State(state): State<AppState>) -> Json<IpsetStatus> {
    Json(state.ipset.status().await)
}

#[derive(Serialize)]
struct ListResponse {
    ips: Vec<String>,
    count: usize,
}

async fn list(
    State(state): State<AppState>,
    Query(selector): Query<SetSelector>,
) -> Json<ListResponse> {
    let ips = state
        .ipset
        .list(selector.permanent, selector.direction)
        .await;
    Json(ListResponse {
        count: ips.len(),
        ips,
    })
}

#[derive(Deserialize)]
struct SingleIpRequest {
    ip: String,
    #[serde(default = "default_permanent")]
    permanent: bool,
    #[serde(default = "default_direction")]
    direction: Direction,
}

async fn add(
    State(state): State<AppState>,
    Json(request): Json<SingleIpRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state
        .ipset
        .add(&request.ip, request.permanent, request.direction)
        .await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn remove(
    State(state): State<AppState>,
    Json(request): Json<SingleIpRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state
        .ipset
        .remove(&request.ip, request.permanent, request.direction)
        .await?;
    Ok(Json(ActionResponse::ok(message)))
}

#[derive(Deserialize)]
struct BulkRequest {
    ips: Vec<String>,
    #[serde(default = "default_permanent")]
    permanent: bool,
    #[serde(default = "default_direction")]
    direction: Direction,
}

#[derive(Serialize)]
struct BulkResponse {
    success: bool,
    succeeded: usize,
    failed: usize,
    errors: Vec<String>,
}

async fn bulk_add(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Json<BulkResponse> {
    let (succeeded, failed, errors) = state
        .ipset
        .bulk_add(&request.ips, request.permanent, request.direction)
        .await;
    Json(BulkResponse {
        success: failed == 0,
        succeeded,
        failed,
        errors,
    })
}

async fn bulk_remove(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Json<BulkResponse> {
    let (succeeded, failed, errors) = state
        .ipset
        .bulk_remove(&request.ips, request.permanent, request.direction)
        .await;
    Json(BulkResponse {
        success: failed == 0,
        succeeded,
        failed,
        errors,
    })
}

#[derive(Serialize)]
struct SyncResponse {
    success: bool,
    added: usize,
    removed: usize,
    invalid: Vec<String>,
    total: usize,
    message: String,
}

async fn sync(
    State(state): State<AppState>,
    Json(request): Json<IpsetSyncRequest>,
) -> ApiResult<Json<SyncResponse>> {
    let outcome = state
        .ipset
        .sync(&request.ips, request.permanent, request.direction)
        .await?;
    Ok(Json(SyncResponse {
        success: true,
        message: format!(
            "Synced: added {}, removed {}",
            outcome.added, outcome.removed
        ),
        added: outcome.added,
        removed: outcome.removed,
        invalid: outcome.invalid,
        total: outcome.total,
    }))
}

async fn clear(
    State(state): State<AppState>,
    Json(request): Json<SetSelector>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state
        .ipset
        .clear_set(request.permanent, request.direction)
        .await?;
    Ok(Json(ActionResponse::ok(message)))
}

#[derive(Deserialize)]
struct TimeoutRequest {
    seconds: u64,
}

async fn set_timeout(
    State(state): State<AppState>,
    Json(request): Json<TimeoutRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state.ipset.set_timeout(request.seconds).await?;
    Ok(Json(ActionResponse::ok(message)))
}
