//! `/api/anomalies` - analyzer settings, the anomaly log, and manual
//! analysis runs.

use super::{ApiResult, PanelState};
use crate::store::anomalies::{self, AnalyzerSettings};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<PanelState> {
    Router::new()
        .route("/settings", get(get_settings).put(update_settings))
        .route("/log", get(log))
        .route("/log/:id/resolve", post(resolve))
        .route("/analyze-now", post(analyze_now))
        .route("/status", get(status))
}

async fn get_settings(State(state): State<PanelState>) -> ApiResult<Json<AnalyzerSettings>> {
    Ok(Json(anomalies::analyzer_settings(&state.pool).await?))
}

#[derive(Deserialize)]
struct SettingsUpdate {
    enabled: Option<bool>,
    check_interval_minutes: Option<i64>,
    traffic_limit_gb: Option<f64>,
    ip_limit_multiplier: Option<f64>,
    check_hwid_anomalies: Option<bool>,
    telegram_bot_token: Option<String>,
    telegram_chat_id: Option<String>,
}

async fn update_settings(
    State(state): State<PanelState>,
    Json(request): Json<SettingsUpdate>,
) -> ApiResult<Json<Value>> {
    let mut settings = anomalies::analyzer_settings(&state.pool).await?;
    if let Some(enabled) = request.enabled {
        settings.enabled = enabled;
    }
    if let Some(minutes) = request.check_interval_minutes {
        settings.check_interval_minutes = minutes.clamp(15, 120);
    }
    if let Some(limit) = request.traffic_limit_gb {
        settings.traffic_limit_gb = limit.max(1.0);
    }
    if let Some(multiplier) = request.ip_limit_multiplier {
        settings.ip_limit_multiplier = multiplier.max(1.0);
    }
    if let Some(check) = request.check_hwid_anomalies {
        settings.check_hwid_anomalies = check;
    }
    if let Some(token) = request.telegram_bot_token {
        settings.telegram_bot_token = Some(token);
    }
    if let Some(chat_id) = request.telegram_chat_id {
        settings.telegram_chat_id = Some(chat_id);
    }
    anomalies::save_analyzer_settings(&state.pool, &settings).await?;
    Ok(Json(json!({"message": "Analyzer settings updated"})))
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn log(
    State(state): State<PanelState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Value>> {
    let entries = anomalies::list_anomalies(&state.pool, query.limit.clamp(1, 1000)).await?;
    Ok(Json(json!({"anomalies": entries})))
}

async fn resolve(
    State(state): State<PanelState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    anomalies::resolve_anomaly(&state.pool, id).await?;
    Ok(Json(json!({"message": "Anomaly resolved"})))
}

async fn analyze_now(State(state): State<PanelState>) -> Json<Value> {
    Json(state.analyzer.run_analysis().await)
}

async fn status(State(state): State<PanelState>) -> Json<Value> {
    Json(state.analyzer.status().await)
}
