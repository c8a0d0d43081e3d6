use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
