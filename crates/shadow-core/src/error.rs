use thiserror::Error;

/// Errors surfaced by the DAO and the shared data-model helpers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("shadow not found: {0}")]
    NotFound(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config io error: {0}")]
    ConfigIo(String),

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error("payload too large: {actual} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { actual: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, CoreError>;
