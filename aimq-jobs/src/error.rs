//! Job processing errors.

use aimq_queue::QueueError;
use thiserror::Error;

/// Errors that may occur while processing a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("email delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("report generation failed: {0}")]
    ReportFailed(String),
}

impl From<JobError> for QueueError {
    fn from(err: JobError) -> Self {
        QueueError::ExecutionFailed(err.to_string())
    }
}
