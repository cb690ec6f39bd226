//! Job lifecycle event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgeflow_core::Job;

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// A timer job was inserted into the timer set.
    TimerScheduled,
    /// A job exhausted its retries and was parked.
    JobMovedToDeadLetter,
    /// A job's handler ran to completion and the record was deleted.
    JobExecutionSuccess,
    /// A job's handler failed; retry handling has been invoked.
    JobExecutionFailure,
    /// The worker pool refused a job submission (saturation).
    JobRejected,
}

/// A notification about a single job, carrying a snapshot of the record at
/// the time the event fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
    /// Present for failure kinds.
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, job: Job) -> Self {
        Self {
            kind,
            job,
            error: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn failure(kind: JobEventKind, job: Job, error: impl Into<String>) -> Self {
        Self {
            kind,
            job,
            error: Some(error.into()),
            occurred_at: Utc::now(),
        }
    }
}
