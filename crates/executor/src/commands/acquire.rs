//! Batch acquisition of due jobs.
//!
//! Acquisition is a page query plus a per-row lock write. Two instances
//! racing for the same row both select it, but exactly one lock write
//! succeeds; the loser's row is skipped, not failed — it simply acquires
//! fewer rows this cycle.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use forgeflow_core::{Job, JobServiceResult, JobSet};

use crate::command::{Command, CommandContext};

fn lock_rows(
    ctx: &CommandContext,
    set: JobSet,
    candidates: Vec<Job>,
    lock_owner: &str,
    lock_duration: Duration,
) -> JobServiceResult<Vec<Job>> {
    let until = Utc::now() + chrono::Duration::from_std(lock_duration).unwrap_or_default();
    let mut acquired = Vec::with_capacity(candidates.len());

    for mut job in candidates {
        job.lock(lock_owner, until);
        match ctx.store().update(set, &mut job) {
            Ok(()) => acquired.push(job),
            Err(error) if error.is_optimistic_locking() => {
                debug!(job_id = %job.id, set = %set, "lost acquisition race for row");
            }
            Err(error) => return Err(error.into()),
        }
    }

    Ok(acquired)
}

/// Claim up to `max_jobs` due timer jobs for this instance.
#[derive(Debug, Clone)]
pub struct AcquireTimerJobsCmd {
    pub max_jobs: usize,
    pub lock_owner: String,
    pub lock_duration: Duration,
}

impl Command<Vec<Job>> for AcquireTimerJobsCmd {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<Vec<Job>> {
        let candidates = ctx.store().find_due_timer_jobs(Utc::now(), self.max_jobs)?;
        lock_rows(
            ctx,
            JobSet::Timer,
            candidates,
            &self.lock_owner,
            self.lock_duration,
        )
    }
}

/// Claim up to `max_jobs` due executable jobs for this instance.
#[derive(Debug, Clone)]
pub struct AcquireJobsCmd {
    pub max_jobs: usize,
    pub lock_owner: String,
    pub lock_duration: Duration,
}

impl Command<Vec<Job>> for AcquireJobsCmd {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<Vec<Job>> {
        let candidates = ctx
            .store()
            .find_due_executable_jobs(Utc::now(), self.max_jobs)?;
        lock_rows(
            ctx,
            JobSet::Executable,
            candidates,
            &self.lock_owner,
            self.lock_duration,
        )
    }
}
