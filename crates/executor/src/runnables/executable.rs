//! Executable-job acquisition loop: claim due jobs up to the pool's
//! remaining capacity and offer them to the executor.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::async_executor::AsyncExecutor;
use crate::commands::AcquireJobsCmd;
use crate::lock::with_global_lock;
use crate::wait::WaitMonitor;

pub(crate) fn async_acquisition_loop(executor: Arc<AsyncExecutor>, monitor: Arc<WaitMonitor>) {
    info!(lock_owner = %executor.config().lock_owner, "async job acquisition started");
    let global_lock = executor.global_lock_manager("async-jobs");

    while !monitor.is_stop_requested() {
        let wait = run_cycle(&executor, global_lock.as_ref(), &monitor);
        if monitor.sleep(wait) {
            break;
        }
    }

    info!("async job acquisition stopped");
}

fn run_cycle(
    executor: &Arc<AsyncExecutor>,
    global_lock: Option<&crate::lock::AcquireLockManager>,
    monitor: &WaitMonitor,
) -> Duration {
    let config = executor.config();

    // Backpressure: while the pool is saturated, do not even query the
    // store — nothing could be offered anyway.
    let capacity = executor.remaining_capacity();
    if capacity == 0 {
        debug!("worker pool full, skipping acquisition cycle");
        return config.default_queue_size_full_wait;
    }

    let max_jobs = capacity.min(config.max_async_jobs_due_per_acquisition);
    let store = executor.command_executor().context().store();

    let outcome = with_global_lock(global_lock, store, monitor, || {
        executor.command_executor().execute(AcquireJobsCmd {
            max_jobs,
            lock_owner: config.lock_owner.clone(),
            lock_duration: config.async_job_lock_time,
        })
    });

    let acquired = match outcome {
        None => return config.default_async_job_acquire_wait,
        Some(Ok(acquired)) => acquired,
        Some(Err(error)) if error.is_optimistic_locking() => {
            debug!(error = %error, "async acquisition lost a race to another instance");
            return config.default_async_job_acquire_wait;
        }
        Some(Err(error)) => {
            error!(error = %error, "async acquisition cycle failed");
            return config.default_async_job_acquire_wait;
        }
    };

    executor.record_async_acquired(acquired.len() as u64);
    let acquired_count = acquired.len();

    // Capacity may have changed between the check and these offers; the
    // executor unacquires anything the pool rejects.
    let mut rejected = 0usize;
    for job in acquired {
        if !executor.execute_async_job(job) {
            rejected += 1;
        }
    }

    if rejected > 0 {
        debug!(rejected, "worker pool rejected offers, backing off");
        config.default_queue_size_full_wait
    } else if acquired_count >= max_jobs {
        // Full page: more work is likely due, poll again immediately.
        Duration::ZERO
    } else {
        config.default_async_job_acquire_wait
    }
}
