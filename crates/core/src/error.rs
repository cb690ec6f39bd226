//! Job service error model.

use thiserror::Error;

use crate::id::JobId;

/// Result type used across the job service layer.
pub type JobServiceResult<T> = Result<T, JobServiceError>;

/// Errors surfaced by job commands, the job manager, and job execution.
///
/// `OptimisticLocking` is a distinguished kind: in a clustered deployment it
/// means a concurrent engine instance won a race on a row, which is routine
/// and handled by yielding, not by failing the loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobServiceError {
    /// A concurrent writer modified the record since it was read.
    #[error("optimistic locking failure: {0}")]
    OptimisticLocking(String),

    /// No record with the given id in the expected set.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Insert collided with an existing record (any of the four sets).
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// No handler is registered for the job's handler type.
    #[error("no job handler registered for type '{0}'")]
    HandlerMissing(String),

    /// The job's handler ran and failed.
    #[error("job handler failed: {0}")]
    HandlerFailed(String),

    /// The backing store failed for a non-concurrency reason.
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobServiceError {
    pub fn optimistic_locking(msg: impl Into<String>) -> Self {
        Self::OptimisticLocking(msg.into())
    }

    pub fn handler_failed(msg: impl Into<String>) -> Self {
        Self::HandlerFailed(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for the expected-contention kind that callers log at debug and
    /// skip rather than treat as a real failure.
    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, Self::OptimisticLocking(_))
    }
}
