//! Per-job execution on the worker pool, and the failure-handling chain.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use forgeflow_core::{Job, JobId, JobServiceError, JobSet};
use forgeflow_events::{JobEvent, JobEventKind};

use crate::async_executor::AsyncExecutor;
use crate::command::{Command, CommandConfig, CommandContext, CommandExecutor};
use crate::commands::{DefaultJobRetryCmd, LockExclusiveJobCmd, UnlockExclusiveJobCmd};

/// A candidate in the failure-handler chain. Each handler gets first refusal
/// of a failed execution; returning `true` claims the failure and stops the
/// chain, otherwise the default retry handling runs.
pub trait FailedJobHandler: Send + Sync {
    fn try_handle(&self, job: &Job, error: &JobServiceError, executor: &CommandExecutor) -> bool;
}

/// Pluggable strategy for what "handle a failed job" means.
pub trait RetryCommandFactory: Send + Sync {
    fn command(&self, job_id: JobId, error: &JobServiceError)
        -> Box<dyn Command<()> + Send + Sync>;
}

/// Default factory: decrement retries, reschedule as a delayed timer or
/// dead-letter.
#[derive(Debug, Clone)]
pub struct DefaultRetryCommandFactory {
    pub retry_wait_time: Duration,
}

impl RetryCommandFactory for DefaultRetryCommandFactory {
    fn command(
        &self,
        job_id: JobId,
        error: &JobServiceError,
    ) -> Box<dyn Command<()> + Send + Sync> {
        Box::new(DefaultJobRetryCmd {
            job_id,
            error_message: error.to_string(),
            error_detail: None,
            retry_wait_time: self.retry_wait_time,
        })
    }
}

enum TaskPayload {
    /// The full record as it was acquired.
    Job(Box<Job>),
    /// Only the id was known at construction time; the record is re-fetched
    /// before running.
    Id(JobId),
}

/// The unit of work submitted to the worker pool for one job.
pub(crate) struct ExecutionTask {
    executor: Arc<AsyncExecutor>,
    payload: TaskPayload,
}

impl ExecutionTask {
    pub(crate) fn new(executor: Arc<AsyncExecutor>, job: Job) -> Self {
        Self {
            executor,
            payload: TaskPayload::Job(Box::new(job)),
        }
    }

    pub(crate) fn from_id(executor: Arc<AsyncExecutor>, job_id: JobId) -> Self {
        Self {
            executor,
            payload: TaskPayload::Id(job_id),
        }
    }

    pub(crate) fn run(self) {
        let Some(job) = self.resolve_job() else {
            return;
        };

        if job.exclusive && !self.lock_exclusive(&job) {
            // Routine contention: the scope is busy, the job never ran, so
            // it goes back to the pool without spending a retry.
            return;
        }

        let result = self
            .executor
            .command_executor()
            .execute(|ctx: &CommandContext| ctx.job_manager().execute(ctx, &job));

        if job.exclusive {
            self.unlock_exclusive(&job);
        }

        match result {
            Ok(()) => self.executor.record_executed(),
            Err(error) if error.is_optimistic_locking() => {
                debug!(job_id = %job.id, error = %error, "job execution hit expected cluster contention");
            }
            Err(error) => self.handle_failure(job, error),
        }
    }

    fn resolve_job(&self) -> Option<Job> {
        match &self.payload {
            TaskPayload::Job(job) => Some((**job).clone()),
            TaskPayload::Id(id) => {
                let id = *id;
                let fetched = self
                    .executor
                    .command_executor()
                    .execute(move |ctx: &CommandContext| {
                        Ok(ctx.store().find(JobSet::Executable, id)?)
                    });
                match fetched {
                    Ok(Some(job)) => Some(job),
                    Ok(None) => {
                        debug!(job_id = %id, "job disappeared before execution");
                        None
                    }
                    Err(error) => {
                        error!(job_id = %id, error = %error, "failed to re-fetch job");
                        None
                    }
                }
            }
        }
    }

    /// Scope locks are held per job, not per instance: two workers of one
    /// engine instance contending for the same scope must conflict exactly
    /// like workers of different instances.
    fn scope_lock_owner(&self, job: &Job) -> String {
        format!("{}:{}", self.executor.config().lock_owner, job.id)
    }

    fn lock_exclusive(&self, job: &Job) -> bool {
        let config = self.executor.config();
        let locked = self.executor.command_executor().execute(LockExclusiveJobCmd {
            job: job.clone(),
            lock_owner: self.scope_lock_owner(job),
            lock_duration: config.async_job_lock_time,
        });

        match locked {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    job_id = %job.id,
                    scope = ?job.exclusive_scope_key(),
                    "exclusive scope busy, unacquiring job"
                );
                self.unacquire(job);
                false
            }
            Err(error) => {
                if error.is_optimistic_locking() {
                    debug!(job_id = %job.id, error = %error, "exclusive lock lost to a concurrent worker");
                } else {
                    error!(job_id = %job.id, error = %error, "exclusive lock attempt failed");
                }
                self.unacquire(job);
                false
            }
        }
    }

    fn unlock_exclusive(&self, job: &Job) {
        let unlocked = self.executor.command_executor().execute(UnlockExclusiveJobCmd {
            job: job.clone(),
            lock_owner: self.scope_lock_owner(job),
        });
        if let Err(error) = unlocked {
            // Best-effort: the job itself already completed or failed.
            debug!(job_id = %job.id, error = %error, "failed to release exclusive scope lock");
        }
    }

    fn unacquire(&self, job: &Job) {
        let result = self.executor.command_executor().execute_with(
            CommandConfig::requires_new(),
            |ctx: &CommandContext| {
                ctx.job_manager()
                    .unacquire(ctx, JobSet::Executable, job)
                    .map(|_| ())
            },
        );
        if let Err(error) = result {
            if error.is_optimistic_locking() {
                debug!(job_id = %job.id, error = %error, "unacquire lost a row race");
            } else {
                error!(job_id = %job.id, error = %error, "failed to unacquire job");
            }
        }
    }

    fn handle_failure(&self, job: Job, error: JobServiceError) {
        self.executor.record_failed();

        for handler in self.executor.failure_handlers().iter() {
            if handler.try_handle(&job, &error, self.executor.command_executor()) {
                return;
            }
        }

        error!(job_id = %job.id, handler_type = %job.handler_type, error = %error, "async job execution failed");

        let retry = self.executor.retry_factory().command(job.id, &error);
        let retry_result = self
            .executor
            .command_executor()
            .execute_with(CommandConfig::requires_new(), retry);
        if let Err(retry_error) = retry_result {
            if retry_error.is_optimistic_locking() {
                debug!(job_id = %job.id, error = %retry_error, "retry handling lost a row race");
            } else {
                error!(job_id = %job.id, error = %retry_error, "retry handling failed");
            }
        }

        // Guarded dispatch: a notification problem cannot mask the failure.
        self.executor.command_executor().context().publish(JobEvent::failure(
            JobEventKind::JobExecutionFailure,
            job,
            error.to_string(),
        ));
    }
}
