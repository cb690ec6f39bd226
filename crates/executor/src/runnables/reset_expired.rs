//! Reset-expired-jobs loop: release locks that outlived their expiration.
//!
//! A crash leaves every row the dead instance had claimed locked until its
//! expiration passes. This loop pages through expired locks and unacquires
//! each row, draining the whole backlog before sleeping again so
//! availability recovers promptly after a crash.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use forgeflow_core::{Job, JobSet};

use crate::async_executor::AsyncExecutor;
use crate::command::{CommandConfig, CommandContext};
use crate::wait::WaitMonitor;

pub(crate) fn reset_expired_jobs_loop(executor: Arc<AsyncExecutor>, monitor: Arc<WaitMonitor>) {
    info!(lock_owner = %executor.config().lock_owner, "reset-expired-jobs loop started");

    while !monitor.is_stop_requested() {
        drain_expired(&executor, &monitor);
        if monitor.sleep(executor.config().reset_expired_jobs_interval) {
            break;
        }
    }

    info!("reset-expired-jobs loop stopped");
}

/// Page through expired jobs until a query comes back empty. Optimistic
/// failures on single rows are tolerated; any other failure ends the drain
/// early so a persistent error cannot turn into a tight retry spin.
fn drain_expired(executor: &AsyncExecutor, monitor: &WaitMonitor) {
    let page_size = executor.config().reset_expired_jobs_page_size;

    loop {
        if monitor.is_stop_requested() {
            return;
        }

        let page = executor
            .command_executor()
            .execute(|ctx: &CommandContext| {
                Ok(ctx.store().find_expired_jobs(Utc::now(), page_size)?)
            });

        let page: Vec<(JobSet, Job)> = match page {
            Ok(page) => page,
            Err(error) => {
                error!(error = %error, "expired-jobs query failed");
                return;
            }
        };
        if page.is_empty() {
            return;
        }

        let mut reset = 0u64;
        for (set, job) in page {
            // One unit of work per row, so a lost race on one row cannot
            // roll back the others.
            let result = executor.command_executor().execute_with(
                CommandConfig::requires_new(),
                move |ctx: &CommandContext| {
                    ctx.job_manager().unacquire(ctx, set, &job).map(|_| ())
                },
            );
            match result {
                Ok(()) => reset += 1,
                Err(error) if error.is_optimistic_locking() => {
                    debug!(error = %error, "expired job changed while resetting");
                }
                Err(error) => {
                    error!(error = %error, "failed to reset expired job");
                    executor.record_expired_reset(reset);
                    return;
                }
            }
        }
        executor.record_expired_reset(reset);
    }
}
