//! Execution-scope locks for exclusive jobs.

use std::time::Duration;

use chrono::Utc;

use forgeflow_core::{Job, JobServiceResult};

use crate::command::{Command, CommandContext};

/// Try to take the exclusive-execution lock for a job's scope.
///
/// Yields `false` when another worker already holds the scope — routine
/// contention, after which the job is unacquired without spending a retry.
/// A job with no scope key has nothing to lock and trivially succeeds.
#[derive(Debug, Clone)]
pub struct LockExclusiveJobCmd {
    pub job: Job,
    pub lock_owner: String,
    pub lock_duration: Duration,
}

impl Command<bool> for LockExclusiveJobCmd {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<bool> {
        let Some(scope) = self.job.exclusive_scope_key() else {
            return Ok(true);
        };
        let until = Utc::now() + chrono::Duration::from_std(self.lock_duration).unwrap_or_default();
        Ok(ctx.store().try_lock_scope(scope, &self.lock_owner, until)?)
    }
}

/// Release the exclusive-execution lock after running the job. Best-effort:
/// callers log failures rather than propagate them, since the job itself
/// already completed or failed.
#[derive(Debug, Clone)]
pub struct UnlockExclusiveJobCmd {
    pub job: Job,
    pub lock_owner: String,
}

impl Command<()> for UnlockExclusiveJobCmd {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<()> {
        if let Some(scope) = self.job.exclusive_scope_key() {
            ctx.store().unlock_scope(scope, &self.lock_owner)?;
        }
        Ok(())
    }
}
