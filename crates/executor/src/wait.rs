//! Interruptible sleep shared by the polling runnables.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct WaitState {
    stop_requested: bool,
    waiting: bool,
}

/// Condition-variable backed sleep with a race-free stop.
///
/// The stop flag is checked under the same mutex the wait releases, so a
/// `stop` arriving between the decision to wait and the wait itself cannot
/// be lost. The `waiting` marker records whether a sleeper is parked; `stop`
/// only signals when one is.
#[derive(Debug, Default)]
pub struct WaitMonitor {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for up to `timeout`, waking immediately on [`WaitMonitor::stop`].
    /// Returns true when stop has been requested.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.stop_requested {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        state.waiting = true;
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.stop_requested)
            .unwrap();
        state.waiting = false;
        state.stop_requested
    }

    /// Request stop and wake a parked sleeper.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stop_requested = true;
        if state.waiting {
            self.cond.notify_all();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.lock().unwrap().stop_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn sleep_runs_to_timeout_without_stop() {
        let monitor = WaitMonitor::new();
        let started = Instant::now();
        assert!(!monitor.sleep(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn stop_wakes_a_parked_sleeper_early() {
        let monitor = Arc::new(WaitMonitor::new());
        let sleeper = Arc::clone(&monitor);

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let stopped = sleeper.sleep(Duration::from_secs(30));
            (stopped, started.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        monitor.stop();

        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn stop_before_sleep_returns_immediately() {
        let monitor = WaitMonitor::new();
        monitor.stop();
        let started = Instant::now();
        assert!(monitor.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn zero_timeout_does_not_park() {
        let monitor = WaitMonitor::new();
        assert!(!monitor.sleep(Duration::ZERO));
    }
}
