use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, CommonError>;
