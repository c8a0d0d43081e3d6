//! Error-to-HTTP mapping for the node API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use edge_haproxy::HaproxyError;
use edge_network::NetworkError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Validation(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<HaproxyError> for ApiError {
    fn from(e: HaproxyError) -> Self {
        match e {
            HaproxyError::RuleNotFound(_) => ApiError::NotFound(e.to_string()),
            HaproxyError::RuleExists(_) => ApiError::BadRequest(e.to_string()),
            HaproxyError::Validation(msg) => ApiError::BadRequest(msg),
            HaproxyError::ConfigInvalid(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<edge_traffic::TrafficError> for ApiError {
    fn from(e: edge_traffic::TrafficError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<edge_xray::XrayError> for ApiError {
    fn from(e: edge_xray::XrayError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
