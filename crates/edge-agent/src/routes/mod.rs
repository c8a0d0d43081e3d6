//! HTTP surface of the node agent.

pub mod haproxy;
pub mod ipset;
pub mod metrics;
pub mod remnawave;
pub mod system;
pub mod traffic;

use crate::security::{security_middleware, SecurityLayerState};
use crate::state::AppState;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    let security_state = SecurityLayerState {
        manager: state.security.clone(),
        api_key: state.config.api_key.clone(),
    };

    Router::new()
        .route("/api/metrics", get(metrics::get_metrics))
        .nest("/api/haproxy", haproxy::router())
        .nest("/api/system", system::router())
        .nest("/api/ipset", ipset::router())
        .nest("/api/traffic", traffic::router())
        .nest("/api/remnawave", remnawave::router())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    security_state,
                    security_middleware,
                )),
        )
}

/// Uniform `{success, message}` payload for mutating endpoints.
#[derive(Debug, serde::Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}
