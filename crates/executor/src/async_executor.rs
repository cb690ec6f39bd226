//! Executor lifecycle: worker pool, polling runnables, and job submission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, error, info};

use forgeflow_core::{Job, JobId, JobSet};
use forgeflow_events::{JobEvent, JobEventKind};

use crate::command::{CommandConfig, CommandContext, CommandExecutor};
use crate::commands::UnacquireOwnedJobsCmd;
use crate::config::AsyncExecutorConfig;
use crate::execution::{
    DefaultRetryCommandFactory, ExecutionTask, FailedJobHandler, RetryCommandFactory,
};
use crate::lock::AcquireLockManager;
use crate::manager::JobManager;
use crate::pool::{FixedWorkerPool, TaskExecutor, TaskRejected};
use crate::runnables::{
    self, ASYNC_ACQUISITION_THREAD, RESET_EXPIRED_THREAD, RunnableHandle, TIMER_ACQUISITION_THREAD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecyclePhase {
    Stopped,
    Starting,
    Active,
    Stopping,
}

/// Executor runtime counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorMetrics {
    pub timer_jobs_acquired: u64,
    pub async_jobs_acquired: u64,
    pub jobs_executed: u64,
    pub jobs_failed: u64,
    pub jobs_rejected: u64,
    pub expired_jobs_reset: u64,
}

/// The per-instance async job executor.
///
/// Owns the worker pool, the two acquisition loops, the reset-expired loop,
/// and this instance's `lock_owner` identity. All mutable runtime state is
/// held here and handed to the runnables by reference; nothing is ambient.
///
/// Lifecycle: Stopped → Starting → Active → Stopping → Stopped. Both
/// [`AsyncExecutor::start`] and [`AsyncExecutor::shutdown`] are idempotent.
pub struct AsyncExecutor {
    config: AsyncExecutorConfig,
    command_executor: CommandExecutor,
    manager: Arc<JobManager>,
    lifecycle: Mutex<LifecyclePhase>,
    pool: RwLock<Option<Arc<dyn TaskExecutor>>>,
    owns_pool: AtomicBool,
    runnables: Mutex<Vec<RunnableHandle>>,
    /// Jobs submitted before the executor became active; drained on start.
    temporary_queue: Mutex<VecDeque<Job>>,
    failure_handlers: RwLock<Vec<Arc<dyn FailedJobHandler>>>,
    retry_factory: RwLock<Arc<dyn RetryCommandFactory>>,
    metrics: Mutex<ExecutorMetrics>,
    /// Back-reference to the owning `Arc`, for handing the executor to
    /// spawned loops and execution tasks.
    self_ref: Weak<AsyncExecutor>,
}

impl AsyncExecutor {
    /// Build an executor around an already wired command executor and job
    /// manager. The returned instance is stopped; call
    /// [`AsyncExecutor::start`] to bring it up.
    pub fn new(
        config: AsyncExecutorConfig,
        command_executor: CommandExecutor,
        manager: Arc<JobManager>,
    ) -> Arc<Self> {
        let retry_factory: Arc<dyn RetryCommandFactory> = Arc::new(DefaultRetryCommandFactory {
            retry_wait_time: config.retry_wait_time,
        });
        Arc::new_cyclic(|self_ref| Self {
            config,
            command_executor,
            manager,
            lifecycle: Mutex::new(LifecyclePhase::Stopped),
            pool: RwLock::new(None),
            owns_pool: AtomicBool::new(false),
            runnables: Mutex::new(Vec::new()),
            temporary_queue: Mutex::new(VecDeque::new()),
            failure_handlers: RwLock::new(Vec::new()),
            retry_factory: RwLock::new(retry_factory),
            metrics: Mutex::new(ExecutorMetrics::default()),
            self_ref: self_ref.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("executor referenced after its Arc was dropped")
    }

    pub fn config(&self) -> &AsyncExecutorConfig {
        &self.config
    }

    pub fn command_executor(&self) -> &CommandExecutor {
        &self.command_executor
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    /// Supply an externally owned worker pool. Must be called before
    /// `start`; an external pool is not shut down with the executor.
    pub fn set_task_executor(&self, pool: Arc<dyn TaskExecutor>) {
        *self.pool.write().unwrap() = Some(pool);
        self.owns_pool.store(false, Ordering::SeqCst);
    }

    /// Prepend-ordered chain of failure handlers, tried before the default
    /// retry handling.
    pub fn add_failed_job_handler(&self, handler: Arc<dyn FailedJobHandler>) {
        self.failure_handlers.write().unwrap().push(handler);
    }

    pub fn set_retry_command_factory(&self, factory: Arc<dyn RetryCommandFactory>) {
        *self.retry_factory.write().unwrap() = factory;
    }

    pub(crate) fn failure_handlers(&self) -> Vec<Arc<dyn FailedJobHandler>> {
        self.failure_handlers.read().unwrap().clone()
    }

    pub(crate) fn retry_factory(&self) -> Arc<dyn RetryCommandFactory> {
        self.retry_factory.read().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lifecycle.lock().unwrap(), LifecyclePhase::Active)
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Remaining capacity of the worker pool; zero while no pool is up.
    pub fn remaining_capacity(&self) -> usize {
        self.pool
            .read()
            .unwrap()
            .as_ref()
            .map(|pool| pool.remaining_capacity())
            .unwrap_or(0)
    }

    /// Bring the executor up: recover owned locks, build the pool if none
    /// was supplied, start the runnables, then drain jobs buffered while
    /// stopped. A no-op when already active.
    pub fn start(&self) {
        {
            let mut phase = self.lifecycle.lock().unwrap();
            if *phase != LifecyclePhase::Stopped {
                return;
            }
            *phase = LifecyclePhase::Starting;
        }

        info!(lock_owner = %self.config.lock_owner, "starting async executor");

        if self.config.unlock_owned_jobs_on_startup {
            self.unlock_owned_jobs("startup");
        }

        {
            let mut pool = self.pool.write().unwrap();
            if pool.is_none() {
                *pool = Some(Arc::new(FixedWorkerPool::new(
                    self.config.core_pool_size,
                    self.config.queue_capacity,
                )));
                self.owns_pool.store(true, Ordering::SeqCst);
            }
        }

        self.manager.register_executor(self.self_ref.clone());

        // Active before the loops spawn: their very first cycle already
        // produces executor hints, which are dropped while inactive.
        *self.lifecycle.lock().unwrap() = LifecyclePhase::Active;

        {
            let mut handles = self.runnables.lock().unwrap();
            if !self.config.message_queue_mode {
                handles.push(runnables::spawn(
                    TIMER_ACQUISITION_THREAD,
                    self.arc(),
                    runnables::timer_acquisition_loop,
                ));
                handles.push(runnables::spawn(
                    ASYNC_ACQUISITION_THREAD,
                    self.arc(),
                    runnables::async_acquisition_loop,
                ));
            }
            handles.push(runnables::spawn(
                RESET_EXPIRED_THREAD,
                self.arc(),
                runnables::reset_expired_jobs_loop,
            ));
        }

        let buffered: Vec<Job> = self.temporary_queue.lock().unwrap().drain(..).collect();
        for job in buffered {
            self.execute_async_job(job);
        }

        info!("async executor started");
    }

    /// Stop the runnables, shut the pool down (when owned), and optionally
    /// release this instance's locks. Idempotent and safe against
    /// concurrent calls.
    pub fn shutdown(&self) {
        {
            let mut phase = self.lifecycle.lock().unwrap();
            match *phase {
                LifecyclePhase::Stopped | LifecyclePhase::Stopping => return,
                _ => *phase = LifecyclePhase::Stopping,
            }
        }

        info!(lock_owner = %self.config.lock_owner, "stopping async executor");

        {
            let mut handles = self.runnables.lock().unwrap();
            for handle in handles.iter() {
                handle.stop();
            }
            for handle in handles.iter_mut() {
                handle.join();
            }
            handles.clear();
        }

        if self.owns_pool.swap(false, Ordering::SeqCst) {
            if let Some(pool) = self.pool.write().unwrap().take() {
                pool.shutdown();
            }
        }

        if self.config.unlock_owned_jobs_on_shutdown {
            self.unlock_owned_jobs("shutdown");
        }

        self.manager.unregister_executor();
        *self.lifecycle.lock().unwrap() = LifecyclePhase::Stopped;
        info!("async executor stopped");
    }

    /// Offer a job for local execution.
    ///
    /// Returns `false` only when the worker pool rejected the submission;
    /// the job has then already been unacquired and the caller should back
    /// off (queue-full wait) before acquiring more work.
    pub fn execute_async_job(&self, job: Job) -> bool {
        if self.config.message_queue_mode {
            // Hand-off happens externally; accepting is all that is needed.
            return true;
        }

        if !self.is_active() {
            self.temporary_queue.lock().unwrap().push_back(job);
            return true;
        }

        let pool = self.pool.read().unwrap().clone();
        let Some(pool) = pool else {
            return false;
        };

        let task = ExecutionTask::new(self.arc(), job.clone());
        match pool.execute(Box::new(move || task.run())) {
            Ok(()) => true,
            Err(TaskRejected) => {
                debug!(job_id = %job.id, "worker pool rejected job");
                self.record_rejected();
                self.command_executor.context().publish(JobEvent::failure(
                    JobEventKind::JobRejected,
                    job.clone(),
                    "worker pool saturated",
                ));

                let rejected = job;
                let result = self.command_executor.execute_with(
                    CommandConfig::requires_new(),
                    move |ctx: &CommandContext| {
                        ctx.job_manager()
                            .unacquire(ctx, JobSet::Executable, &rejected)
                            .map(|_| ())
                    },
                );
                if let Err(error) = result {
                    if error.is_optimistic_locking() {
                        debug!(error = %error, "rejected job was already re-claimed");
                    } else {
                        error!(error = %error, "failed to unacquire rejected job");
                    }
                }
                false
            }
        }
    }

    /// Offer a job known only by its id. The record is re-fetched on the
    /// worker thread right before running, so the task always sees the
    /// final persisted shape. Unlike the full-record path there is no
    /// buffering while stopped.
    pub fn execute_async_job_by_id(&self, job_id: JobId) -> bool {
        if self.config.message_queue_mode {
            return true;
        }
        if !self.is_active() {
            return false;
        }

        let pool = self.pool.read().unwrap().clone();
        let Some(pool) = pool else {
            return false;
        };

        let task = ExecutionTask::from_id(self.arc(), job_id);
        match pool.execute(Box::new(move || task.run())) {
            Ok(()) => true,
            Err(TaskRejected) => {
                debug!(job_id = %job_id, "worker pool rejected job");
                self.record_rejected();
                let result = self.command_executor.execute_with(
                    CommandConfig::requires_new(),
                    move |ctx: &CommandContext| {
                        if let Some(job) = ctx.store().find(JobSet::Executable, job_id)? {
                            ctx.job_manager()
                                .unacquire(ctx, JobSet::Executable, &job)?;
                        }
                        Ok(())
                    },
                );
                if let Err(error) = result {
                    if error.is_optimistic_locking() {
                        debug!(error = %error, "rejected job was already re-claimed");
                    } else {
                        error!(error = %error, "failed to unacquire rejected job");
                    }
                }
                false
            }
        }
    }

    pub(crate) fn global_lock_manager(&self, lock_name: &str) -> Option<AcquireLockManager> {
        if !self.config.global_acquire_lock_enabled {
            return None;
        }
        Some(AcquireLockManager::new(
            &self.config.global_acquire_lock_prefix,
            lock_name,
            self.config.lock_owner.clone(),
            self.config.lock_wait_time,
            self.config.lock_poll_rate,
            self.config.lock_force_acquire_after,
        ))
    }

    fn unlock_owned_jobs(&self, moment: &str) {
        let result = self.command_executor.execute_with(
            CommandConfig::requires_new(),
            UnacquireOwnedJobsCmd {
                lock_owner: self.config.lock_owner.clone(),
            },
        );
        match result {
            Ok(released) if released > 0 => {
                info!(released, moment, "released previously owned job locks");
            }
            Ok(_) => {}
            Err(error) => {
                error!(error = %error, moment, "failed to release owned job locks");
            }
        }
    }

    pub(crate) fn record_timer_acquired(&self, count: u64) {
        self.metrics.lock().unwrap().timer_jobs_acquired += count;
    }

    pub(crate) fn record_async_acquired(&self, count: u64) {
        self.metrics.lock().unwrap().async_jobs_acquired += count;
    }

    pub(crate) fn record_executed(&self) {
        self.metrics.lock().unwrap().jobs_executed += 1;
    }

    pub(crate) fn record_failed(&self) {
        self.metrics.lock().unwrap().jobs_failed += 1;
    }

    pub(crate) fn record_rejected(&self) {
        self.metrics.lock().unwrap().jobs_rejected += 1;
    }

    pub(crate) fn record_expired_reset(&self, count: u64) {
        self.metrics.lock().unwrap().expired_jobs_reset += count;
    }
}

impl core::fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("lock_owner", &self.config.lock_owner)
            .field("phase", &*self.lifecycle.lock().unwrap())
            .finish_non_exhaustive()
    }
}
