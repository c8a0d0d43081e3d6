//! Panel HTTP surface.

pub mod alerts;
pub mod anomalies;
pub mod blocklist;
pub mod bulk;
pub mod proxy;
pub mod remnawave;
pub mod servers;

use crate::alerter::Alerter;
use crate::anomaly::AnomalyAnalyzer;
use crate::blocklist::BlocklistSync;
use crate::collector::FleetCollector;
use crate::config::PanelConfig;
use crate::error::PanelError;
use crate::node_client::NodeClient;
use crate::xray_aggregator::XrayAggregator;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct PanelState {
    pub pool: SqlitePool,
    pub config: Arc<PanelConfig>,
    pub collector: Arc<FleetCollector>,
    pub aggregator: Arc<XrayAggregator>,
    pub blocklist: Arc<BlocklistSync>,
    pub alerter: Arc<Alerter>,
    pub analyzer: Arc<AnomalyAnalyzer>,
    pub node_client: NodeClient,
}

/// Bearer-token gate for the whole API.
async fn auth_middleware(
    State(token): State<Arc<String>>,
    request: Request,
    next: Next,
) -> Response {
    if token.is_empty() {
        return next.run(request).await;
    }
    let presented = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(token.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Not authenticated"})),
        )
            .into_response()
    }
}

pub fn router(state: PanelState) -> Router {
    let token = Arc::new(state.config.auth_token.clone());

    Router::new()
        .nest("/api/servers", servers::router())
        .nest("/api/proxy", proxy::router())
        .nest("/api/blocklist", blocklist::router())
        .nest("/api/remnawave", remnawave::router())
        .nest("/api/alerts", alerts::router())
        .nest("/api/anomalies", anomalies::router())
        .nest("/api/bulk", bulk::router())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(middleware::from_fn_with_state(token, auth_middleware)),
        )
}

/// Error body shape shared by every endpoint.
pub struct ApiError(pub PanelError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PanelError::Validation(_) => StatusCode::BAD_REQUEST,
            PanelError::NotFound(_) => StatusCode::NOT_FOUND,
            PanelError::Http(_) | PanelError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"detail": self.0.to_string()}))).into_response()
    }
}

impl From<PanelError> for ApiError {
    fn from(e: PanelError) -> Self {
        ApiError(e)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
