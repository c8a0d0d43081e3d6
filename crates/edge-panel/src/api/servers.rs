//! `/api/servers` - fleet registry CRUD, ordering, folders and
//! connectivity tests.

use super::{ApiResult, PanelState};
use crate::store::servers::{self, Server, ServerCreate, ServerUpdate};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub fn router() -> Router<PanelState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/reorder", post(reorder))
        .route("/move-to-folder", post(move_to_folder))
        .route("/folders/rename", post(rename_folder))
        .route("/folders/:name", axum::routing::delete(delete_folder))
        .route("/:id", get(get_one).put(update).delete(delete))
        .route("/:id/test", post(test_connection))
}

#[derive(Serialize)]
struct ServerOut {
    #[serde(flatten)]
    server: Server,
    online: bool,
}

fn to_out(server: Server) -> ServerOut {
    let online = server
        .last_seen
        .map(|seen| crate::store::now_naive() - seen < chrono::Duration::seconds(60))
        .unwrap_or(false);
    ServerOut { server, online }
}

async fn list(State(state): State<PanelState>) -> ApiResult<Json<Vec<ServerOut>>> {
    let rows = servers::list(&state.pool).await?;
    Ok(Json(rows.into_iter().map(to_out).collect()))
}

async fn get_one(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ServerOut>> {
    Ok(Json(to_out(servers::get(&state.pool, id).await?)))
}

async fn create(
    State(state): State<PanelState>,
    Json(request): Json<ServerCreate>,
) -> ApiResult<Json<Value>> {
    let id = servers::create(&state.pool, &request).await?;
    Ok(Json(json!({"id": id, "message": "Server created"})))
}

async fn update(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
    Json(request): Json<ServerUpdate>,
) -> ApiResult<Json<Value>> {
    servers::update(&state.pool, id, &request).await?;
    Ok(Json(json!({"message": "Server updated"})))
}

async fn delete(State(state): State<PanelState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    servers::delete(&state.pool, id).await?;
    Ok(Json(json!({"message": "Server deleted"})))
}

#[derive(Deserialize)]
struct ReorderRequest {
    server_ids: Vec<i64>,
}

async fn reorder(
    State(state): State<PanelState>,
    Json(request): Json<ReorderRequest>,
) -> ApiResult<Json<Value>> {
    servers::reorder(&state.pool, &request.server_ids).await?;
    Ok(Json(json!({"message": "Order updated"})))
}

#[derive(Deserialize)]
struct MoveToFolderRequest {
    server_ids: Vec<i64>,
    folder: Option<String>,
}

async fn move_to_folder(
    State(state): State<PanelState>,
    Json(request): Json<MoveToFolderRequest>,
) -> ApiResult<Json<Value>> {
    servers::move_to_folder(&state.pool, &request.server_ids, request.folder.as_deref()).await?;
    Ok(Json(json!({"message": "Servers moved"})))
}

#[derive(Deserialize)]
struct RenameFolderRequest {
    from: String,
    to: String,
}

async fn rename_folder(
    State(state): State<PanelState>,
    Json(request): Json<RenameFolderRequest>,
) -> ApiResult<Json<Value>> {
    let updated = servers::rename_folder(&state.pool, &request.from, &request.to).await?;
    Ok(Json(json!({"message": "Folder renamed", "servers_updated": updated})))
}

async fn delete_folder(
    State(state): State<PanelState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let updated = servers::clear_folder(&state.pool, &name).await?;
    Ok(Json(json!({"message": "Folder removed", "servers_updated": updated})))
}

async fn test_connection(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let server = servers::get(&state.pool, id).await?;
    match state.node_client.fetch_metrics(&server).await {
        Ok((doc, _)) => Ok(Json(json!({
            "success": true,
            "message": "Connection successful",
            "server_name": doc.server_name,
        }))),
        Err(poll_error) => Ok(Json(json!({
            "success": false,
            "message": poll_error.message,
            "error_code": poll_error.code,
        }))),
    }
}
