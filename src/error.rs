use thiserror::Error;

#[derive(Error, Debug)]
pub enum AskError {
    #[error("Classification error: {0}")]
    Classification(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Write operations are forbidden - SELECT queries only")]
    WriteRejected,

    #[error("SQL execution error: {0}")]
    SqlExecution(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::prelude::PolarsError> for AskError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        AskError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AskError>;
