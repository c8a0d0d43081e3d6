use thiserror::Error;

#[derive(Error, Debug)]
pub enum XrayError {
    #[error("Log source error: {0}")]
    LogSource(String),

    #[error("Blocklist error: {0}")]
    Blocklist(#[from] edge_network::NetworkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, XrayError>;
