//! Default handling for a failed job execution.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use forgeflow_core::{JobId, JobServiceResult, JobSet};

use crate::command::{Command, CommandContext};

/// The retry-command factory's default product: spend a retry and either
/// reschedule the job as a delayed timer or dead-letter it.
///
/// Runs in its own fresh unit of work, after the failing execution's has
/// been abandoned.
#[derive(Debug, Clone)]
pub struct DefaultJobRetryCmd {
    pub job_id: JobId,
    pub error_message: String,
    pub error_detail: Option<String>,
    pub retry_wait_time: Duration,
}

impl Command<()> for DefaultJobRetryCmd {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<()> {
        let Some(job) = ctx.store().find(JobSet::Executable, self.job_id)? else {
            // Completed, moved, or unacquired by someone else in the
            // meantime; nothing left to retry.
            debug!(job_id = %self.job_id, "failed job no longer present, skipping retry");
            return Ok(());
        };

        let mut failed = job;
        failed.exception_message = Some(self.error_message.clone());
        failed.exception_stacktrace = self.error_detail.clone();

        if failed.retries <= 1 {
            failed.retries = 0;
            ctx.job_manager()
                .move_job_to_dead_letter_job(ctx, JobSet::Executable, &failed)?;
            return Ok(());
        }

        failed.retries -= 1;
        failed.clear_lock();
        failed.due_date =
            Some(Utc::now() + chrono::Duration::from_std(self.retry_wait_time).unwrap_or_default());
        ctx.job_manager().move_job_to_timer_job(ctx, &failed)?;
        Ok(())
    }
}
