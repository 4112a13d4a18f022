//! Error types for the queue service.

use thiserror::Error;

/// Errors that may occur while interacting with the queue service.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend is unavailable")]
    Unavailable,

    #[error("queue `{0}` is closed")]
    QueueClosed(String),

    #[error("invalid connection settings: {0}")]
    InvalidConnection(String),

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("failed to (de)serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job execution failed: {0}")]
    ExecutionFailed(String),
}

impl QueueError {
    /// Convenience constructor used by processors.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(message.into())
    }
}
