//! Timer acquisition loop: claim due timers, convert them to executables.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use forgeflow_core::JobServiceResult;

use crate::async_executor::AsyncExecutor;
use crate::command::{CommandConfig, CommandContext};
use crate::commands::AcquireTimerJobsCmd;
use crate::lock::with_global_lock;
use crate::wait::WaitMonitor;

pub(crate) fn timer_acquisition_loop(executor: Arc<AsyncExecutor>, monitor: Arc<WaitMonitor>) {
    info!(lock_owner = %executor.config().lock_owner, "timer acquisition started");
    let global_lock = executor.global_lock_manager("timer-jobs");

    while !monitor.is_stop_requested() {
        let wait = run_cycle(&executor, global_lock.as_ref(), &monitor);
        if monitor.sleep(wait) {
            break;
        }
    }

    info!("timer acquisition stopped");
}

fn run_cycle(
    executor: &AsyncExecutor,
    global_lock: Option<&crate::lock::AcquireLockManager>,
    monitor: &WaitMonitor,
) -> Duration {
    let config = executor.config();
    let store = executor.command_executor().context().store();

    let outcome = with_global_lock(global_lock, store, monitor, || {
        acquire_and_convert(executor)
    });

    match outcome {
        // Another instance holds the cluster-wide acquisition lock.
        None => config.default_timer_job_acquire_wait,
        Some(Ok(acquired)) if acquired >= config.max_timer_jobs_per_acquisition => {
            // A full page means more work is likely waiting; poll again
            // immediately.
            Duration::ZERO
        }
        Some(Ok(_)) => config.default_timer_job_acquire_wait,
        Some(Err(error)) if error.is_optimistic_locking() => {
            debug!(error = %error, "timer acquisition lost a race to another instance");
            config.default_timer_job_acquire_wait
        }
        Some(Err(error)) => {
            error!(error = %error, "timer acquisition cycle failed");
            config.default_timer_job_acquire_wait
        }
    }
}

fn acquire_and_convert(executor: &AsyncExecutor) -> JobServiceResult<usize> {
    let config = executor.config();

    let acquired = executor.command_executor().execute(AcquireTimerJobsCmd {
        max_jobs: config.max_timer_jobs_per_acquisition,
        lock_owner: config.lock_owner.clone(),
        lock_duration: config.timer_lock_time,
    })?;
    executor.record_timer_acquired(acquired.len() as u64);

    let count = acquired.len();
    if count == 0 {
        return Ok(0);
    }

    // Second unit of work: convert every claimed timer. A timer whose
    // destination row already exists is skipped by the manager without
    // touching the source.
    executor.command_executor().execute_with(
        CommandConfig::requires_new(),
        |ctx: &CommandContext| {
            for timer in &acquired {
                ctx.job_manager().move_timer_job_to_executable_job(ctx, timer)?;
            }
            Ok(())
        },
    )?;

    Ok(count)
}
