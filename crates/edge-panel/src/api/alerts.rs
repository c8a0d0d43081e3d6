//! `/api/alerts` - alerter settings, history and Telegram test.

use super::{ApiResult, PanelState};
use crate::store::alerts::{self, AlertSettings};
use crate::telegram;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<PanelState> {
    Router::new()
        .route("/settings", get(get_settings).put(update_settings))
        .route("/history", get(history))
        .route("/status", get(status))
        .route("/test-telegram", post(test_telegram))
}

async fn get_settings(State(state): State<PanelState>) -> ApiResult<Json<AlertSettings>> {
    Ok(Json(alerts::alert_settings(&state.pool).await?))
}

async fn update_settings(
    State(state): State<PanelState>,
    Json(settings): Json<AlertSettings>,
) -> ApiResult<Json<Value>> {
    alerts::save_alert_settings(&state.pool, &settings).await?;
    Ok(Json(json!({"message": "Alert settings updated"})))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn history(
    State(state): State<PanelState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let entries = alerts::alert_history(&state.pool, query.limit.clamp(1, 1000)).await?;
    Ok(Json(json!({"alerts": entries})))
}

async fn status(State(state): State<PanelState>) -> Json<Value> {
    Json(state.alerter.status().await)
}

#[derive(Deserialize)]
struct TelegramTest {
    bot_token: String,
    chat_id: String,
}

async fn test_telegram(Json(request): Json<TelegramTest>) -> Json<Value> {
    match telegram::test_send(&request.bot_token, &request.chat_id).await {
        Ok(()) => Json(json!({"success": true, "message": "Test message sent"})),
        Err(error) => Json(json!({"success": false, "error": error})),
    }
}
