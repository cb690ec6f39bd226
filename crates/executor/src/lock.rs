//! Optional global acquisition lock.
//!
//! When enabled, acquisition cycles are serialized across the whole cluster
//! through a named lock in the shared store rather than relying only on
//! per-row optimistic locking. The lock expires after
//! `lock_force_acquire_after`, so a holder that died is taken over instead
//! of blocking acquisition forever.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use crate::store::JobStore;
use crate::wait::WaitMonitor;

/// Cluster-wide lock around one acquisition loop.
#[derive(Debug, Clone)]
pub struct AcquireLockManager {
    lock_name: String,
    lock_owner: String,
    wait_time: Duration,
    poll_rate: Duration,
    force_acquire_after: Duration,
}

impl AcquireLockManager {
    pub fn new(
        prefix: &str,
        lock_name: &str,
        lock_owner: impl Into<String>,
        wait_time: Duration,
        poll_rate: Duration,
        force_acquire_after: Duration,
    ) -> Self {
        Self {
            lock_name: format!("{prefix}{lock_name}"),
            lock_owner: lock_owner.into(),
            wait_time,
            poll_rate,
            force_acquire_after,
        }
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Poll for the lock until it is held, `wait_time` elapses, or the
    /// monitor is stopped. Returns true when the lock was taken.
    pub fn wait_for_lock(&self, store: &dyn JobStore, monitor: &WaitMonitor) -> bool {
        let deadline = Instant::now() + self.wait_time;
        loop {
            let until = Utc::now()
                + chrono::Duration::from_std(self.force_acquire_after).unwrap_or_default();
            match store.try_lock_scope(&self.lock_name, &self.lock_owner, until) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(error) => {
                    debug!(lock = %self.lock_name, error = %error, "global lock attempt failed");
                }
            }
            if Instant::now() >= deadline {
                debug!(lock = %self.lock_name, "gave up waiting for global acquire lock");
                return false;
            }
            if monitor.sleep(self.poll_rate) {
                return false;
            }
        }
    }

    /// Best-effort release; an error only means the lock will lapse on its
    /// own once `lock_force_acquire_after` passes.
    pub fn release(&self, store: &dyn JobStore) {
        if let Err(error) = store.unlock_scope(&self.lock_name, &self.lock_owner) {
            debug!(lock = %self.lock_name, error = %error, "global lock release failed");
        }
    }
}

/// Wrap an acquisition body in the global lock when one is configured.
/// Returns `None` when the lock could not be taken and the cycle should be
/// skipped.
pub(crate) fn with_global_lock<T>(
    manager: Option<&AcquireLockManager>,
    store: &dyn JobStore,
    monitor: &WaitMonitor,
    body: impl FnOnce() -> T,
) -> Option<T> {
    match manager {
        None => Some(body()),
        Some(manager) => {
            if !manager.wait_for_lock(store, monitor) {
                return None;
            }
            let result = body();
            manager.release(store);
            Some(result)
        }
    }
}
