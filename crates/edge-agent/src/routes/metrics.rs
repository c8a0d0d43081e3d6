use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use edge_types::metrics::MetricsDocument;

pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsDocument> {
    Json(state.metrics.all_metrics().await)
}
