//! Job handler registry and the opaque repetition schedule.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use forgeflow_core::{Job, JobServiceResult};

use crate::command::CommandContext;

/// Business logic behind a job's `handler_type`.
pub trait JobHandler: Send + Sync {
    /// The registry key this handler answers to.
    fn handler_type(&self) -> &str;

    /// Run the job. Errors route through the failure-handler chain and the
    /// retry command; they never kill the worker.
    fn execute(
        &self,
        job: &Job,
        configuration: &serde_json::Value,
        ctx: &CommandContext,
    ) -> JobServiceResult<()>;
}

struct FnJobHandler<F> {
    handler_type: String,
    run: F,
}

impl<F> JobHandler for FnJobHandler<F>
where
    F: Fn(&Job, &serde_json::Value, &CommandContext) -> JobServiceResult<()> + Send + Sync,
{
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    fn execute(
        &self,
        job: &Job,
        configuration: &serde_json::Value,
        ctx: &CommandContext,
    ) -> JobServiceResult<()> {
        (self.run)(job, configuration, ctx)
    }
}

/// Registry mapping handler types to handlers.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.handler_type().to_string(), handler);
    }

    /// Register a closure under a handler type.
    pub fn register_fn<F>(&mut self, handler_type: impl Into<String>, run: F)
    where
        F: Fn(&Job, &serde_json::Value, &CommandContext) -> JobServiceResult<()>
            + Send
            + Sync
            + 'static,
    {
        let handler_type = handler_type.into();
        self.handlers.insert(
            handler_type.clone(),
            Arc::new(FnJobHandler { handler_type, run }),
        );
    }

    pub fn lookup(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }
}

impl core::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("handler_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Opaque next-fire-time function for repeating timers.
///
/// Repetition-expression parsing (cron, ISO repetitions, business calendars)
/// lives outside this subsystem; the executor only asks "given this
/// expression, when is the next occurrence after `base`?".
pub trait RepeatSchedule: Send + Sync {
    fn next_fire_time(&self, repeat: &str, base: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

impl<F> RepeatSchedule for F
where
    F: Fn(&str, DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync,
{
    fn next_fire_time(&self, repeat: &str, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self(repeat, base)
    }
}

/// Schedule that never yields a next occurrence. The default for engines
/// that do not use repeating timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRepeat;

impl RepeatSchedule for NoRepeat {
    fn next_fire_time(&self, _repeat: &str, _base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeflow_core::JobKind;

    #[test]
    fn lookup_finds_registered_handlers() {
        let mut registry = JobHandlerRegistry::new();
        registry.register_fn("send-mail", |_job, _config, _ctx| Ok(()));

        assert!(registry.lookup("send-mail").is_some());
        assert!(registry.lookup("unknown").is_none());
    }

    #[test]
    fn fn_handlers_receive_the_configuration() {
        let mut registry = JobHandlerRegistry::new();
        registry.register_fn("check", |_job, config, _ctx| {
            assert_eq!(config["n"], 7);
            Ok(())
        });

        let job = Job::new(JobKind::Async, "check", serde_json::json!({"n": 7}));
        let manager = Arc::new(crate::manager::JobManager::new(
            Arc::new(JobHandlerRegistry::new()),
            Arc::new(NoRepeat),
        ));
        let ctx = crate::command::CommandContext::new(
            Arc::new(crate::store::InMemoryJobStore::new()),
            Arc::new(forgeflow_events::InMemoryEventBus::new()),
            manager,
        );

        let handler = registry.lookup("check").unwrap();
        handler
            .execute(&job, &job.handler_configuration, &ctx)
            .unwrap();
    }

    #[test]
    fn closures_implement_repeat_schedule() {
        let schedule = |_repeat: &str, base: DateTime<Utc>| Some(base + chrono::Duration::minutes(5));
        let base = Utc::now();
        assert_eq!(
            schedule.next_fire_time("every-5m", base),
            Some(base + chrono::Duration::minutes(5))
        );
        assert_eq!(NoRepeat.next_fire_time("every-5m", base), None);
    }
}
