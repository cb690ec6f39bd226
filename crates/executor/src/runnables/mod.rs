//! The executor's three polling loops.
//!
//! Each loop runs on its own named thread until told to stop, sleeps on an
//! interruptible [`WaitMonitor`](crate::wait::WaitMonitor), and is never
//! allowed to die from a single bad iteration: unexpected errors are logged
//! and the loop retries after the default wait.

pub mod executable;
pub mod reset_expired;
pub mod timer;

pub(crate) use executable::async_acquisition_loop;
pub(crate) use reset_expired::reset_expired_jobs_loop;
pub(crate) use timer::timer_acquisition_loop;

use std::sync::Arc;
use std::thread;

use crate::async_executor::AsyncExecutor;
use crate::wait::WaitMonitor;

pub(crate) const TIMER_ACQUISITION_THREAD: &str = "forgeflow-acquire-timer-jobs";
pub(crate) const ASYNC_ACQUISITION_THREAD: &str = "forgeflow-acquire-async-jobs";
pub(crate) const RESET_EXPIRED_THREAD: &str = "forgeflow-reset-expired-jobs";

/// Handle to one spawned loop: stop wakes its sleep, join waits for exit.
#[derive(Debug)]
pub(crate) struct RunnableHandle {
    monitor: Arc<WaitMonitor>,
    join: Option<thread::JoinHandle<()>>,
}

impl RunnableHandle {
    pub(crate) fn stop(&self) {
        self.monitor.stop();
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn spawn(
    name: &'static str,
    executor: Arc<AsyncExecutor>,
    body: fn(Arc<AsyncExecutor>, Arc<WaitMonitor>),
) -> RunnableHandle {
    let monitor = Arc::new(WaitMonitor::new());
    let loop_monitor = Arc::clone(&monitor);
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(executor, loop_monitor))
        .expect("failed to spawn executor loop thread");

    RunnableHandle {
        monitor,
        join: Some(join),
    }
}
