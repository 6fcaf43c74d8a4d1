//! Errors surfaced TO IPC callers (§7 "User-visible behavior").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("resource not found")]
    ResourceNotFound,

    #[error("version conflict")]
    Conflict,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("too many requests")]
    Throttled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl From<shadow_core::CoreError> for IpcError {
    fn from(err: shadow_core::CoreError) -> Self {
        match err {
            shadow_core::CoreError::NotFound(_) => IpcError::ResourceNotFound,
            shadow_core::CoreError::PayloadTooLarge { actual, limit } => IpcError::InvalidArguments(
                format!("payload of {actual} bytes exceeds the {limit}-byte limit"),
            ),
            other => IpcError::Internal(other.to_string()),
        }
    }
}

impl From<shadow_harness::RateLimitError> for IpcError {
    fn from(_: shadow_harness::RateLimitError) -> Self {
        IpcError::Throttled
    }
}
