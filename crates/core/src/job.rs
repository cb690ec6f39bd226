//! The job record model.
//!
//! A job is a **flat record** keyed by id plus a handler-type/configuration
//! blob; it never references other entities directly, only by opaque
//! correlation strings. Records live in exactly one of four disjoint sets at
//! any time, and move between them by delete-and-insert, never in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Retry budget given to newly created jobs.
pub const DEFAULT_RETRIES: u32 = 3;

/// The four disjoint record sets a job row can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSet {
    /// Scheduled for the future; acquired and converted to executable when due.
    Timer,
    /// Ready to run now.
    Executable,
    /// Removed from scheduling until reactivated.
    Suspended,
    /// Exhausted retries; parked for manual intervention.
    DeadLetter,
}

impl core::fmt::Display for JobSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobSet::Timer => write!(f, "timer"),
            JobSet::Executable => write!(f, "executable"),
            JobSet::Suspended => write!(f, "suspended"),
            JobSet::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

/// Scheduling flavor of a job.
///
/// Suspended and dead-letter records keep the kind of the set they came from,
/// so reactivation can route timers back to the timer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Timer,
    Async,
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id; stable across set moves, rotated on unacquire.
    pub id: JobId,
    /// Optimistic-lock version, incremented on each update.
    pub revision: u32,
    pub kind: JobKind,
    /// When the job becomes due. `None` means due now.
    pub due_date: Option<DateTime<Utc>>,
    /// Stops repetition: no next occurrence is scheduled at or past this.
    pub end_date: Option<DateTime<Utc>>,
    /// Engine instance currently holding the row, if any.
    pub lock_owner: Option<String>,
    /// When the processing lock lapses. Set and cleared together with
    /// `lock_owner`.
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// Remaining attempt count.
    pub retries: u32,
    /// When true the target execution scope must not run two jobs at once.
    pub exclusive: bool,
    /// Key into the handler registry.
    pub handler_type: String,
    /// Opaque payload passed to the handler.
    pub handler_configuration: serde_json::Value,
    /// Repetition expression, opaque to this subsystem.
    pub repeat: Option<String>,
    /// Remaining occurrences for a repeating timer.
    pub max_iterations: Option<u32>,
    pub execution_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_definition_id: Option<String>,
    pub scope_id: Option<String>,
    pub sub_scope_id: Option<String>,
    pub scope_type: Option<String>,
    /// Populated when an execution attempt failed.
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job with the default retry budget, due now.
    pub fn new(kind: JobKind, handler_type: impl Into<String>, configuration: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            revision: 1,
            kind,
            due_date: None,
            end_date: None,
            lock_owner: None,
            lock_expiration_time: None,
            retries: DEFAULT_RETRIES,
            exclusive: false,
            handler_type: handler_type.into(),
            handler_configuration: configuration,
            repeat: None,
            max_iterations: None,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            scope_id: None,
            sub_scope_id: None,
            scope_type: None,
            exception_message: None,
            exception_stacktrace: None,
            tenant_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_repeat(mut self, repeat: impl Into<String>, max_iterations: Option<u32>) -> Self {
        self.repeat = Some(repeat.into());
        self.max_iterations = max_iterations;
        self
    }

    /// Mark the job exclusive for its execution scope.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_process_instance(mut self, process_instance_id: impl Into<String>) -> Self {
        self.process_instance_id = Some(process_instance_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>, scope_type: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self.scope_type = Some(scope_type.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Whether the job is due at `now`. A null due date means due now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.due_date {
            Some(due) => due <= now,
            None => true,
        }
    }

    /// Locked iff both lock fields are set and the expiration is in the future.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    /// Expired iff both lock fields are set and the expiration has passed.
    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expires)) => expires <= now,
            _ => false,
        }
    }

    /// Take the processing lock. Both fields are set together.
    pub fn lock(&mut self, owner: impl Into<String>, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration_time = Some(until);
    }

    /// Release the processing lock. Both fields are cleared together.
    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// The key an exclusive job locks before running: the process instance,
    /// falling back to the scope id for scope-based jobs.
    pub fn exclusive_scope_key(&self) -> Option<&str> {
        self.process_instance_id
            .as_deref()
            .or(self.scope_id.as_deref())
    }
}
