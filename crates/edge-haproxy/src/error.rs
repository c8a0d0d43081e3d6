use thiserror::Error;

#[derive(Error, Debug)]
pub enum HaproxyError {
    #[error("{0}")]
    Validation(String),

    #[error("Rule '{0}' not found")]
    RuleNotFound(String),

    #[error("Rule '{0}' already exists")]
    RuleExists(String),

    #[error("Config validation failed: {0}")]
    ConfigInvalid(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HaproxyError>;
