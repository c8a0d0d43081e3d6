//! `/api/traffic` - time-series queries and tracked-port management.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use edge_traffic::{InterfaceTotals, PeriodTraffic, PortChange, PortTotals, TotalTraffic};
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/hourly", get(hourly))
        .route("/daily", get(daily))
        .route("/monthly", get(monthly))
        .route("/summary", get(summary))
        .route("/ports", get(ports_summary))
        .route("/interfaces", get(interfaces_summary))
        .route("/ports/tracked", get(tracked_ports).post(add_port))
        .route("/ports/tracked/:port", delete(remove_port))
}

#[derive(Deserialize)]
struct SeriesQuery {
    #[serde(default)]
    hours: Option<i64>,
    #[serde(default)]
    days: Option<i64>,
    #[serde(default)]
    months: Option<i64>,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Serialize)]
struct SeriesResponse {
    data: Vec<PeriodTraffic>,
}

async fn hourly(
    State(state): State<AppState>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Json<SeriesResponse>> {
    let data = state
        .traffic
        .hourly(
            query.hours.unwrap_or(24),
            query.interface.as_deref(),
            query.port,
        )
        .await?;
    Ok(Json(SeriesResponse { data }))
}

async fn daily(
    State(state): State<AppState>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Json<SeriesResponse>> {
    let data = state
        .traffic
        .daily(
            query.days.unwrap_or(30),
            query.interface.as_deref(),
            query.port,
        )
        .await?;
    Ok(Json(SeriesResponse { data }))
}

async fn monthly(
    State(state): State<AppState>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Json<SeriesResponse>> {
    let data = state
        .traffic
        .monthly(
            query.months.unwrap_or(12),
            query.interface.as_deref(),
            query.port,
        )
        .await?;
    Ok(Json(SeriesResponse { data }))
}

#[derive(Deserialize)]
struct DaysQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

async fn summary(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Json<TotalTraffic>> {
    Ok(Json(state.traffic.total_traffic(query.days).await?))
}

#[derive(Serialize)]
struct PortsResponse {
    ports: Vec<PortTotals>,
}

async fn ports_summary(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Json<PortsResponse>> {
    Ok(Json(PortsResponse {
        ports: state.traffic.port_summary(query.days).await?,
    }))
}

#[derive(Serialize)]
struct InterfacesResponse {
    interfaces: Vec<InterfaceTotals>,
}

async fn interfaces_summary(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Json<InterfacesResponse>> {
    Ok(Json(InterfacesResponse {
        interfaces: state.traffic.interface_summary(query.days).await?,
    }))
}

#[derive(Serialize)]
struct TrackedPortsResponse {
    ports: Vec<u16>,
}

async fn tracked_ports(State(state): State<AppState>) -> Json<TrackedPortsResponse> {
    Json(TrackedPortsResponse {
        ports: state.traffic.tracked_ports().await,
    })
}

#[derive(Deserialize)]
struct AddPortRequest {
    port: u16,
}

async fn add_port(
    State(state): State<AppState>,
    Json(request): Json<AddPortRequest>,
) -> Json<PortChange> {
    Json(state.traffic.add_tracked_port(request.port).await)
}

async fn remove_port(State(state): State<AppState>, Path(port): Path<u16>) -> Json<PortChange> {
    Json(state.traffic.remove_tracked_port(port).await)
}
