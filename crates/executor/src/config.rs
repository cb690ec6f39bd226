//! Async executor configuration.

use std::time::Duration;

use uuid::Uuid;

/// Tunables for the async executor and its three polling loops.
///
/// Every field can be set directly or through the `with_*` builders; the
/// defaults match a clustered production deployment. `lock_owner` **must be
/// unique per cluster member** — the default random identity guarantees
/// that, so only override it with care.
#[derive(Debug, Clone)]
pub struct AsyncExecutorConfig {
    /// Identity written into `lock_owner` on every row this instance claims.
    pub lock_owner: String,

    /// Per-cycle cap for the timer acquisition loop.
    pub max_timer_jobs_per_acquisition: usize,
    /// Per-cycle cap for the executable-job acquisition loop.
    pub max_async_jobs_due_per_acquisition: usize,

    /// Sleep between timer acquisition cycles that found less than a full
    /// page.
    pub default_timer_job_acquire_wait: Duration,
    /// Sleep between executable acquisition cycles that found less than a
    /// full page.
    pub default_async_job_acquire_wait: Duration,
    /// Sleep after a cycle in which the worker pool rejected offers (or had
    /// no capacity to begin with).
    pub default_queue_size_full_wait: Duration,

    /// How long a claimed timer job stays locked.
    pub timer_lock_time: Duration,
    /// How long a claimed executable job stays locked.
    pub async_job_lock_time: Duration,

    /// Outer sleep of the reset-expired loop.
    pub reset_expired_jobs_interval: Duration,
    /// Page size of each expired-jobs query.
    pub reset_expired_jobs_page_size: usize,

    /// Due-date offset used when a failed job is rescheduled for retry.
    pub retry_wait_time: Duration,

    /// Worker threads in the internally built pool.
    pub core_pool_size: usize,
    /// Queue slots in front of the workers.
    pub queue_capacity: usize,

    /// When true, acquisition is external (a message queue feeds jobs) and
    /// `execute_async_job` accepts without local execution.
    pub message_queue_mode: bool,

    /// Release rows still locked by this `lock_owner` when starting
    /// (crash-recovery cleanup).
    pub unlock_owned_jobs_on_startup: bool,
    /// Release rows locked by this `lock_owner` when shutting down.
    pub unlock_owned_jobs_on_shutdown: bool,

    /// Serialize acquisition across the whole cluster instead of per row.
    pub global_acquire_lock_enabled: bool,
    /// Prefix for the global lock names (lets engines share a store without
    /// sharing a lock).
    pub global_acquire_lock_prefix: String,
    /// How long an acquisition cycle waits for the global lock before
    /// skipping the cycle.
    pub lock_wait_time: Duration,
    /// Poll interval while waiting for the global lock.
    pub lock_poll_rate: Duration,
    /// A global lock older than this is presumed abandoned and taken over.
    pub lock_force_acquire_after: Duration,
}

impl Default for AsyncExecutorConfig {
    fn default() -> Self {
        Self {
            lock_owner: format!("forgeflow-{}", Uuid::now_v7()),
            max_timer_jobs_per_acquisition: 512,
            max_async_jobs_due_per_acquisition: 512,
            default_timer_job_acquire_wait: Duration::from_secs(10),
            default_async_job_acquire_wait: Duration::from_secs(10),
            default_queue_size_full_wait: Duration::from_secs(5),
            timer_lock_time: Duration::from_secs(60 * 60),
            async_job_lock_time: Duration::from_secs(60 * 60),
            reset_expired_jobs_interval: Duration::from_secs(60),
            reset_expired_jobs_page_size: 3,
            retry_wait_time: Duration::from_secs(10),
            core_pool_size: 8,
            queue_capacity: 100,
            message_queue_mode: false,
            unlock_owned_jobs_on_startup: false,
            unlock_owned_jobs_on_shutdown: false,
            global_acquire_lock_enabled: false,
            global_acquire_lock_prefix: String::new(),
            lock_wait_time: Duration::from_secs(60),
            lock_poll_rate: Duration::from_millis(500),
            lock_force_acquire_after: Duration::from_secs(10 * 60),
        }
    }
}

impl AsyncExecutorConfig {
    pub fn with_lock_owner(mut self, lock_owner: impl Into<String>) -> Self {
        self.lock_owner = lock_owner.into();
        self
    }

    pub fn with_pool(mut self, core_pool_size: usize, queue_capacity: usize) -> Self {
        self.core_pool_size = core_pool_size;
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_acquire_waits(mut self, timer: Duration, async_jobs: Duration) -> Self {
        self.default_timer_job_acquire_wait = timer;
        self.default_async_job_acquire_wait = async_jobs;
        self
    }

    pub fn with_queue_full_wait(mut self, wait: Duration) -> Self {
        self.default_queue_size_full_wait = wait;
        self
    }

    pub fn with_reset_expired(mut self, interval: Duration, page_size: usize) -> Self {
        self.reset_expired_jobs_interval = interval;
        self.reset_expired_jobs_page_size = page_size;
        self
    }

    pub fn with_retry_wait_time(mut self, wait: Duration) -> Self {
        self.retry_wait_time = wait;
        self
    }

    pub fn with_message_queue_mode(mut self) -> Self {
        self.message_queue_mode = true;
        self
    }

    pub fn with_unlock_owned_jobs(mut self, on_startup: bool, on_shutdown: bool) -> Self {
        self.unlock_owned_jobs_on_startup = on_startup;
        self.unlock_owned_jobs_on_shutdown = on_shutdown;
        self
    }

    pub fn with_global_acquire_lock(mut self, prefix: impl Into<String>) -> Self {
        self.global_acquire_lock_enabled = true;
        self.global_acquire_lock_prefix = prefix.into();
        self
    }
}
