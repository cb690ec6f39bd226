//! Command execution pipeline.
//!
//! Every mutation of the job store runs as a command against a
//! [`CommandContext`]. The executor mirrors a transactional backend's
//! propagation surface: `Required` joins the caller's unit of work,
//! `RequiresNew` always opens a fresh one. Against the in-memory store each
//! store call is already atomic, so propagation is recorded for parity and
//! multi-record invariants are upheld by operation ordering
//! (insert-before-delete on moves).
//!
//! Optimistic-locking failures pass through unconverted so callers can
//! classify them as expected contention rather than real errors.

use std::sync::Arc;

use tracing::{trace, warn};

use forgeflow_core::JobServiceResult;
use forgeflow_events::{EventBus, JobEvent};

use crate::manager::JobManager;
use crate::store::JobStore;

/// How a command's unit of work relates to the caller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionPropagation {
    /// Join the caller's unit of work (the common case).
    #[default]
    Required,
    /// Always open a fresh unit of work, independent of the caller's
    /// outcome. Used for unacquires and retry handling triggered from a
    /// failing operation.
    RequiresNew,
}

/// Per-execution command options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandConfig {
    pub propagation: TransactionPropagation,
}

impl CommandConfig {
    pub fn required() -> Self {
        Self {
            propagation: TransactionPropagation::Required,
        }
    }

    pub fn requires_new() -> Self {
        Self {
            propagation: TransactionPropagation::RequiresNew,
        }
    }
}

/// What a command sees while executing: the store, the event bus, and the
/// job manager.
pub struct CommandContext {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus>,
    manager: Arc<JobManager>,
}

impl CommandContext {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<dyn EventBus>, manager: Arc<JobManager>) -> Self {
        Self {
            store,
            bus,
            manager,
        }
    }

    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub fn job_manager(&self) -> &JobManager {
        &self.manager
    }

    /// Fire-and-forget notification dispatch. A bus failure is logged and
    /// swallowed so it can never mask the job outcome that produced it.
    pub fn publish(&self, event: JobEvent) {
        if let Err(error) = self.bus.publish(event) {
            warn!(error = %error, "job event dispatch failed");
        }
    }
}

impl core::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandContext").finish_non_exhaustive()
    }
}

/// A unit of work against the job store.
pub trait Command<T> {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<T>;
}

impl<F, T> Command<T> for F
where
    F: Fn(&CommandContext) -> JobServiceResult<T>,
{
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<T> {
        self(ctx)
    }
}

impl<T> Command<T> for Box<dyn Command<T> + Send + Sync> {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<T> {
        (**self).execute(ctx)
    }
}

/// Runs commands against a shared context.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    context: Arc<CommandContext>,
}

impl CommandExecutor {
    pub fn new(context: Arc<CommandContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &CommandContext {
        &self.context
    }

    /// Execute a command in the caller's unit of work.
    pub fn execute<T>(&self, command: impl Command<T>) -> JobServiceResult<T> {
        self.execute_with(CommandConfig::required(), command)
    }

    /// Execute a command with explicit propagation.
    pub fn execute_with<T>(
        &self,
        config: CommandConfig,
        command: impl Command<T>,
    ) -> JobServiceResult<T> {
        trace!(propagation = ?config.propagation, "executing job command");
        command.execute(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{JobHandlerRegistry, NoRepeat};
    use crate::store::InMemoryJobStore;
    use forgeflow_core::{Job, JobKind, JobServiceError, JobSet};
    use forgeflow_events::InMemoryEventBus;

    fn executor() -> CommandExecutor {
        let manager = Arc::new(JobManager::new(
            Arc::new(JobHandlerRegistry::new()),
            Arc::new(NoRepeat),
        ));
        let context = Arc::new(CommandContext::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryEventBus::new()),
            manager,
        ));
        CommandExecutor::new(context)
    }

    #[test]
    fn closure_commands_execute_against_the_context() {
        let executor = executor();
        let job = Job::new(JobKind::Async, "test", serde_json::json!({}));
        let id = job.id;

        executor
            .execute(|ctx: &CommandContext| {
                ctx.store().insert(JobSet::Executable, job.clone())?;
                Ok(())
            })
            .unwrap();

        let found = executor
            .execute(|ctx: &CommandContext| Ok(ctx.store().find(JobSet::Executable, id)?))
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn store_errors_convert_preserving_the_optimistic_kind() {
        let executor = executor();
        let job = Job::new(JobKind::Async, "test", serde_json::json!({}));

        executor
            .execute(|ctx: &CommandContext| Ok(ctx.store().insert(JobSet::Executable, job.clone())?))
            .unwrap();

        let err = executor
            .execute_with(CommandConfig::requires_new(), |ctx: &CommandContext| {
                let mut current = ctx
                    .store()
                    .find(JobSet::Executable, job.id)?
                    .ok_or(JobServiceError::JobNotFound(job.id))?;
                ctx.store().update(JobSet::Executable, &mut current)?;
                // Second writer with the original revision loses.
                let mut stale = job.clone();
                ctx.store().update(JobSet::Executable, &mut stale)?;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_optimistic_locking());
    }
}
