// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queue-local error enum, converted to [`abp_error::AbpError`] at the crate
//! boundary per the workspace's shared error taxonomy.

use abp_error::{AbpError, ErrorCode};
use thiserror::Error;

/// Errors returned by [`crate::scheduler::Scheduler`] operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `Enqueue` named an unregistered job type, or its payload failed the
    /// definition's schema.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Admitting the job would exceed per-project or global capacity.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// The dedupe slot is occupied by a conflicting in-flight job.
    #[error("job conflict: {0}")]
    JobConflict(String),

    /// `Enqueue` was aborted because its caller's guard was cancelled
    /// before the job was admitted.
    #[error("enqueue cancelled: {0}")]
    Cancelled(String),

    /// Snapshot file could not be read or written.
    #[error("snapshot io error: {0}")]
    SnapshotIo(#[source] std::io::Error),

    /// Snapshot file contents could not be parsed as JSON.
    #[error("snapshot decode error: {0}")]
    SnapshotDecode(#[source] serde_json::Error),
}

impl From<QueueError> for AbpError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidPayload(ref msg) => {
                AbpError::new(ErrorCode::InvalidPayload, msg.clone()).with_source(err)
            }
            QueueError::QueueFull(ref msg) => {
                AbpError::new(ErrorCode::QueueFull, msg.clone()).with_source(err)
            }
            QueueError::JobConflict(ref msg) => {
                AbpError::new(ErrorCode::JobConflict, msg.clone()).with_source(err)
            }
            QueueError::Cancelled(ref msg) => {
                AbpError::new(ErrorCode::CapabilityDenied, msg.clone()).with_source(err)
            }
            QueueError::SnapshotIo(_) => {
                AbpError::new(ErrorCode::Internal, "snapshot io error").with_source(err)
            }
            QueueError::SnapshotDecode(_) => {
                AbpError::new(ErrorCode::Internal, "snapshot decode error").with_source(err)
            }
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
