use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Firewall operation failed: {0}")]
    Firewall(String),

    #[error("Ipset operation failed: {0}")]
    Ipset(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
