//! The error taxonomy a sync request execution can fail with (§7), and the
//! classifier the Retryer consults to decide retry/skip/conflict/unknown.

use shadow_core::error::CoreError;
use shadow_harness::retry::ErrorClass;
use thiserror::Error;

use crate::cloud::CloudError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("dao error: {0}")]
    Dao(#[from] CoreError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("queue error: {0}")]
    Queue(#[from] shadow_queue::QueueError),

    #[error("sync metadata missing for this shadow")]
    UnknownShadow,

    #[error("request skipped: {0}")]
    Skip(String),

    #[error("outbound cloud rate limit exceeded")]
    Throttled,

    #[error("shutdown requested")]
    Interrupted,
}

/// Maps an execution failure onto the retry taxonomy the Retryer consumes:
/// transient cloud/transport failures retry, version conflicts and missing
/// sync metadata escalate to a full sync, malformed payloads and other 4xx
/// responses are dropped.
pub fn classify(err: &SyncError) -> ErrorClass {
    match err {
        SyncError::Cloud(CloudError::Throttling(_))
        | SyncError::Cloud(CloudError::ServiceUnavailable(_))
        | SyncError::Cloud(CloudError::InternalFailure(_))
        | SyncError::Cloud(CloudError::Transport(_)) => ErrorClass::Retryable,
        SyncError::Cloud(CloudError::Conflict(_)) => ErrorClass::Conflict,
        SyncError::Cloud(CloudError::ResourceNotFound) => ErrorClass::Skip,
        SyncError::Cloud(CloudError::Unauthorized(_))
        | SyncError::Cloud(CloudError::PayloadTooLarge(_))
        | SyncError::Cloud(CloudError::OtherClient { .. })
        | SyncError::Cloud(CloudError::Serde(_)) => ErrorClass::Skip,
        SyncError::UnknownShadow => ErrorClass::UnknownShadow,
        SyncError::Skip(_) => ErrorClass::Skip,
        SyncError::Throttled => ErrorClass::Retryable,
        SyncError::Interrupted => ErrorClass::Interrupted,
        SyncError::Dao(_) => ErrorClass::Retryable,
        SyncError::Queue(_) => ErrorClass::Interrupted,
    }
}
