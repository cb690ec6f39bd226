//! Job state-transition logic.
//!
//! The manager owns every valid move between the four record sets. It does
//! no polling and no threading; callers supply the command context, and the
//! store's optimistic locking arbitrates races with other engine instances.
//!
//! Move discipline: insert into the destination first, delete the source
//! only once the insert succeeded. An insert collision means a concurrent
//! acquirer already moved the row; the source is left untouched so the job
//! cannot be lost.

use std::sync::{Arc, RwLock, Weak};

use chrono::Utc;
use tracing::debug;

use forgeflow_core::{Job, JobId, JobKind, JobServiceError, JobServiceResult, JobSet};
use forgeflow_events::{JobEvent, JobEventKind};

use crate::async_executor::AsyncExecutor;
use crate::command::CommandContext;
use crate::handler::{JobHandlerRegistry, RepeatSchedule};
use crate::store::JobStoreError;

/// State transitions between the four job sets.
pub struct JobManager {
    registry: Arc<JobHandlerRegistry>,
    schedule: Arc<dyn RepeatSchedule>,
    executor: RwLock<Weak<AsyncExecutor>>,
}

impl JobManager {
    pub fn new(registry: Arc<JobHandlerRegistry>, schedule: Arc<dyn RepeatSchedule>) -> Self {
        Self {
            registry,
            schedule,
            executor: RwLock::new(Weak::new()),
        }
    }

    /// Register the executor that receives hints when jobs become
    /// executable. Called by the executor itself on start.
    pub(crate) fn register_executor(&self, executor: Weak<AsyncExecutor>) {
        *self.executor.write().unwrap() = executor;
    }

    pub(crate) fn unregister_executor(&self) {
        *self.executor.write().unwrap() = Weak::new();
    }

    fn active_executor(&self) -> Option<Arc<AsyncExecutor>> {
        self.executor
            .read()
            .unwrap()
            .upgrade()
            .filter(|executor| executor.is_active())
    }

    /// Insert a timer job and notify listeners.
    pub fn schedule_timer_job(&self, ctx: &CommandContext, timer: Job) -> JobServiceResult<Job> {
        ctx.store().insert(JobSet::Timer, timer.clone())?;
        ctx.publish(JobEvent::new(JobEventKind::TimerScheduled, timer.clone()));
        Ok(timer)
    }

    /// Convert a due timer into an executable job. Returns `None` when a
    /// concurrent acquirer won the move; the source timer is left in place
    /// in that case.
    pub fn move_timer_job_to_executable_job(
        &self,
        ctx: &CommandContext,
        timer: &Job,
    ) -> JobServiceResult<Option<Job>> {
        let mut executable = timer.clone();
        executable.revision = 1;

        match ctx.store().insert(JobSet::Executable, executable.clone()) {
            Ok(()) => {}
            Err(JobStoreError::AlreadyExists(id)) => {
                debug!(job_id = %id, "timer already moved by a concurrent acquirer");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }

        ctx.store().delete(JobSet::Timer, timer)?;
        self.hint_executable_job(ctx, &mut executable);
        Ok(Some(executable))
    }

    /// Move a job back to the timer set, typically to reschedule a retry as
    /// a delayed timer. The caller sets the new due date beforehand.
    pub fn move_job_to_timer_job(
        &self,
        ctx: &CommandContext,
        job: &Job,
    ) -> JobServiceResult<Option<Job>> {
        let mut timer = job.clone();
        timer.revision = 1;

        match ctx.store().insert(JobSet::Timer, timer.clone()) {
            Ok(()) => {}
            Err(JobStoreError::AlreadyExists(id)) => {
                debug!(job_id = %id, "job already rescheduled by a concurrent writer");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }

        ctx.store().delete(JobSet::Executable, job)?;
        Ok(Some(timer))
    }

    /// Remove a job from scheduling.
    pub fn move_job_to_suspended_job(
        &self,
        ctx: &CommandContext,
        from: JobSet,
        job: &Job,
    ) -> JobServiceResult<Job> {
        let mut suspended = job.clone();
        suspended.revision = 1;
        suspended.clear_lock();

        ctx.store().insert(JobSet::Suspended, suspended.clone())?;
        ctx.store().delete(from, job)?;
        Ok(suspended)
    }

    /// Put a suspended job back into scheduling: timers return to the timer
    /// set, everything else becomes executable again.
    pub fn activate_suspended_job(
        &self,
        ctx: &CommandContext,
        suspended: &Job,
    ) -> JobServiceResult<Job> {
        let mut activated = suspended.clone();
        activated.revision = 1;

        match suspended.kind {
            JobKind::Timer => {
                ctx.store().insert(JobSet::Timer, activated.clone())?;
                ctx.store().delete(JobSet::Suspended, suspended)?;
            }
            JobKind::Async => {
                ctx.store().insert(JobSet::Executable, activated.clone())?;
                ctx.store().delete(JobSet::Suspended, suspended)?;
                self.hint_executable_job(ctx, &mut activated);
            }
        }
        Ok(activated)
    }

    /// Park a job for manual intervention. No executor hint: dead-letter
    /// jobs are inert until explicitly moved back.
    pub fn move_job_to_dead_letter_job(
        &self,
        ctx: &CommandContext,
        from: JobSet,
        job: &Job,
    ) -> JobServiceResult<Job> {
        let mut dead = job.clone();
        dead.revision = 1;
        dead.retries = 0;
        dead.clear_lock();

        ctx.store().insert(JobSet::DeadLetter, dead.clone())?;
        ctx.store().delete(from, job)?;

        ctx.publish(JobEvent::failure(
            JobEventKind::JobMovedToDeadLetter,
            dead.clone(),
            dead.exception_message.clone().unwrap_or_default(),
        ));
        Ok(dead)
    }

    /// Revive a dead-letter job with an explicit retry budget.
    pub fn move_dead_letter_job_to_executable_job(
        &self,
        ctx: &CommandContext,
        dead_letter: &Job,
        retries: u32,
    ) -> JobServiceResult<Option<Job>> {
        let mut executable = dead_letter.clone();
        executable.revision = 1;
        executable.retries = retries;
        executable.clear_lock();

        match ctx.store().insert(JobSet::Executable, executable.clone()) {
            Ok(()) => {}
            Err(JobStoreError::AlreadyExists(id)) => {
                debug!(job_id = %id, "dead-letter job already revived");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }

        ctx.store().delete(JobSet::DeadLetter, dead_letter)?;
        self.hint_executable_job(ctx, &mut executable);
        Ok(Some(executable))
    }

    /// Release a claimed row by deleting it and reinserting a copy **under
    /// a fresh id** with the lock cleared.
    ///
    /// The identity rotation keeps a just-released row from being the very
    /// next one the due-date-ordered acquisition query re-selects, and
    /// avoids bumping revisions across stores. External holders of the old
    /// id will no longer find it. No executor hint: the unacquire happened
    /// because of contention or overload, and an immediate retry would
    /// likely fail the same way.
    pub fn unacquire(&self, ctx: &CommandContext, set: JobSet, job: &Job) -> JobServiceResult<Job> {
        ctx.store().delete(set, job)?;

        let mut released = job.clone();
        released.id = JobId::new();
        released.revision = 1;
        released.clear_lock();
        ctx.store().insert(set, released.clone())?;
        Ok(released)
    }

    /// Like [`JobManager::unacquire`], but spends a retry; a job whose
    /// retries would reach zero is dead-lettered instead of requeued.
    pub fn unacquire_with_decrement_retries(
        &self,
        ctx: &CommandContext,
        set: JobSet,
        job: &Job,
    ) -> JobServiceResult<Job> {
        if job.retries <= 1 {
            return self.move_job_to_dead_letter_job(ctx, set, job);
        }

        ctx.store().delete(set, job)?;

        let mut released = job.clone();
        released.id = JobId::new();
        released.revision = 1;
        released.retries = job.retries - 1;
        released.clear_lock();
        ctx.store().insert(set, released.clone())?;
        Ok(released)
    }

    /// Run the job's handler. On success the record is deleted, and a
    /// timer-kind job with a repeat expression gets its next occurrence
    /// scheduled when the schedule yields a future date before `end_date`.
    pub fn execute(&self, ctx: &CommandContext, job: &Job) -> JobServiceResult<()> {
        let handler = self
            .registry
            .lookup(&job.handler_type)
            .ok_or_else(|| JobServiceError::HandlerMissing(job.handler_type.clone()))?;

        handler.execute(job, &job.handler_configuration, ctx)?;

        ctx.store().delete(JobSet::Executable, job)?;
        if matches!(job.kind, JobKind::Timer) {
            if let Some(repeat) = job.repeat.clone() {
                self.schedule_next_occurrence(ctx, job, &repeat)?;
            }
        }

        ctx.publish(JobEvent::new(JobEventKind::JobExecutionSuccess, job.clone()));
        Ok(())
    }

    fn schedule_next_occurrence(
        &self,
        ctx: &CommandContext,
        job: &Job,
        repeat: &str,
    ) -> JobServiceResult<()> {
        if job.max_iterations.is_some_and(|max| max <= 1) {
            return Ok(());
        }

        let now = Utc::now();
        let Some(next) = self.schedule.next_fire_time(repeat, now) else {
            return Ok(());
        };
        if next <= now {
            return Ok(());
        }
        if job.end_date.is_some_and(|end| next >= end) {
            return Ok(());
        }

        let mut next_timer = job.clone();
        next_timer.id = JobId::new();
        next_timer.revision = 1;
        next_timer.clear_lock();
        next_timer.due_date = Some(next);
        next_timer.max_iterations = job.max_iterations.map(|max| max - 1);
        next_timer.exception_message = None;
        next_timer.exception_stacktrace = None;

        self.schedule_timer_job(ctx, next_timer)?;
        Ok(())
    }

    /// Offer a freshly executable job to the registered executor. The row is
    /// locked for this instance first so the acquisition loops skip it; if
    /// that write loses a race, the hint is dropped and normal acquisition
    /// picks the job up instead.
    fn hint_executable_job(&self, ctx: &CommandContext, job: &mut Job) {
        let Some(executor) = self.active_executor() else {
            return;
        };

        if job.lock_owner.is_none() {
            let until = Utc::now()
                + chrono::Duration::from_std(executor.config().async_job_lock_time)
                    .unwrap_or_default();
            job.lock(executor.config().lock_owner.clone(), until);
            if let Err(error) = ctx.store().update(JobSet::Executable, job) {
                debug!(job_id = %job.id, error = %error, "executor hint lost the lock race");
                return;
            }
        }

        executor.execute_async_job(job.clone());
    }
}

impl core::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandContext;
    use crate::handler::NoRepeat;
    use crate::store::{InMemoryJobStore, JobStore};
    use chrono::Duration;
    use forgeflow_events::{EventBus, InMemoryEventBus};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        bus: Arc<InMemoryEventBus>,
        ctx: CommandContext,
        manager: Arc<JobManager>,
    }

    fn fixture() -> Fixture {
        fixture_with(JobHandlerRegistry::new(), Arc::new(NoRepeat))
    }

    fn fixture_with(registry: JobHandlerRegistry, schedule: Arc<dyn RepeatSchedule>) -> Fixture {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let manager = Arc::new(JobManager::new(Arc::new(registry), schedule));
        let ctx = CommandContext::new(store.clone(), bus.clone(), manager.clone());
        Fixture {
            store,
            bus,
            ctx,
            manager,
        }
    }

    fn timer_job() -> Job {
        Job::new(JobKind::Timer, "test", json!({})).with_due_date(Utc::now() - Duration::seconds(1))
    }

    #[test]
    fn schedule_timer_job_inserts_and_notifies() {
        let f = fixture();
        let events = f.bus.subscribe();

        f.manager.schedule_timer_job(&f.ctx, timer_job()).unwrap();

        assert_eq!(f.store.count(JobSet::Timer), 1);
        assert_eq!(events.try_recv().unwrap().kind, JobEventKind::TimerScheduled);
    }

    #[test]
    fn timer_moves_to_executable_and_leaves_the_timer_set() {
        let f = fixture();
        let timer = f.manager.schedule_timer_job(&f.ctx, timer_job()).unwrap();

        let executable = f
            .manager
            .move_timer_job_to_executable_job(&f.ctx, &timer)
            .unwrap()
            .expect("move should succeed");

        assert_eq!(executable.id, timer.id);
        assert_eq!(f.store.count(JobSet::Timer), 0);
        assert_eq!(f.store.count(JobSet::Executable), 1);
    }

    #[test]
    fn failed_move_insert_leaves_the_source_timer() {
        let f = fixture();
        let timer = f.manager.schedule_timer_job(&f.ctx, timer_job()).unwrap();

        // Simulate a concurrent acquirer that already created the
        // destination row.
        let mut stolen = timer.clone();
        stolen.revision = 1;
        f.store.insert(JobSet::Executable, stolen).unwrap();

        let moved = f
            .manager
            .move_timer_job_to_executable_job(&f.ctx, &timer)
            .unwrap();

        assert!(moved.is_none());
        assert_eq!(f.store.count(JobSet::Timer), 1, "source must not be deleted");
    }

    #[test]
    fn suspend_and_activate_round_trip_preserves_the_kind_branch() {
        let f = fixture();
        let timer = f.manager.schedule_timer_job(&f.ctx, timer_job()).unwrap();

        let suspended = f
            .manager
            .move_job_to_suspended_job(&f.ctx, JobSet::Timer, &timer)
            .unwrap();
        assert_eq!(f.store.count(JobSet::Timer), 0);
        assert_eq!(f.store.count(JobSet::Suspended), 1);

        f.manager.activate_suspended_job(&f.ctx, &suspended).unwrap();
        assert_eq!(f.store.count(JobSet::Suspended), 0);
        assert_eq!(f.store.count(JobSet::Timer), 1, "timer kind returns to timers");

        let job = Job::new(JobKind::Async, "test", json!({}));
        f.store.insert(JobSet::Executable, job.clone()).unwrap();
        let suspended = f
            .manager
            .move_job_to_suspended_job(&f.ctx, JobSet::Executable, &job)
            .unwrap();
        f.manager.activate_suspended_job(&f.ctx, &suspended).unwrap();
        assert_eq!(f.store.count(JobSet::Executable), 1);
    }

    #[test]
    fn unacquire_rotates_identity_and_clears_the_lock() {
        let f = fixture();
        let mut job = Job::new(JobKind::Async, "test", json!({}));
        job.lock("instance-a", Utc::now() + Duration::hours(1));
        f.store.insert(JobSet::Executable, job.clone()).unwrap();

        let released = f
            .manager
            .unacquire(&f.ctx, JobSet::Executable, &job)
            .unwrap();

        assert_ne!(released.id, job.id);
        assert!(released.lock_owner.is_none());
        assert!(released.lock_expiration_time.is_none());
        assert_eq!(f.store.count(JobSet::Executable), 1);
        assert!(f.store.find(JobSet::Executable, job.id).unwrap().is_none());
    }

    #[test]
    fn unacquire_of_a_stale_row_is_an_optimistic_failure() {
        let f = fixture();
        let job = Job::new(JobKind::Async, "test", json!({}));
        f.store.insert(JobSet::Executable, job.clone()).unwrap();

        let mut touched = job.clone();
        f.store.update(JobSet::Executable, &mut touched).unwrap();

        let err = f
            .manager
            .unacquire(&f.ctx, JobSet::Executable, &job)
            .unwrap_err();
        assert!(err.is_optimistic_locking());
        assert_eq!(f.store.count(JobSet::Executable), 1, "row must survive");
    }

    #[test]
    fn decrement_unacquire_spends_a_retry() {
        let f = fixture();
        let job = Job::new(JobKind::Async, "test", json!({})).with_retries(3);
        f.store.insert(JobSet::Executable, job.clone()).unwrap();

        let released = f
            .manager
            .unacquire_with_decrement_retries(&f.ctx, JobSet::Executable, &job)
            .unwrap();

        assert_eq!(released.retries, 2);
        assert_ne!(released.id, job.id);
        assert_eq!(f.store.count(JobSet::DeadLetter), 0);
    }

    #[test]
    fn decrement_unacquire_dead_letters_when_retries_run_out() {
        let f = fixture();
        let events = f.bus.subscribe();
        let job = Job::new(JobKind::Async, "test", json!({})).with_retries(1);
        f.store.insert(JobSet::Executable, job.clone()).unwrap();

        let dead = f
            .manager
            .unacquire_with_decrement_retries(&f.ctx, JobSet::Executable, &job)
            .unwrap();

        assert_eq!(dead.retries, 0);
        assert_eq!(f.store.count(JobSet::Executable), 0);
        assert_eq!(f.store.count(JobSet::DeadLetter), 1);
        assert!(
            events
                .drain()
                .iter()
                .any(|e| e.kind == JobEventKind::JobMovedToDeadLetter)
        );
    }

    #[test]
    fn dead_letter_jobs_revive_with_an_explicit_retry_budget() {
        let f = fixture();
        let job = Job::new(JobKind::Async, "test", json!({})).with_retries(1);
        f.store.insert(JobSet::Executable, job.clone()).unwrap();
        let dead = f
            .manager
            .move_job_to_dead_letter_job(&f.ctx, JobSet::Executable, &job)
            .unwrap();

        let revived = f
            .manager
            .move_dead_letter_job_to_executable_job(&f.ctx, &dead, 5)
            .unwrap()
            .expect("revive should succeed");

        assert_eq!(revived.retries, 5);
        assert_eq!(f.store.count(JobSet::DeadLetter), 0);
        assert_eq!(f.store.count(JobSet::Executable), 1);
    }

    #[test]
    fn execute_runs_the_handler_and_deletes_the_record() {
        let mut registry = JobHandlerRegistry::new();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_flag = ran.clone();
        registry.register_fn("test", move |_job, _config, _ctx| {
            ran_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let f = fixture_with(registry, Arc::new(NoRepeat));

        let job = Job::new(JobKind::Async, "test", json!({}));
        f.store.insert(JobSet::Executable, job.clone()).unwrap();

        f.manager.execute(&f.ctx, &job).unwrap();

        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(f.store.count(JobSet::Executable), 0);
    }

    #[test]
    fn execute_without_a_handler_is_an_error_and_keeps_the_record() {
        let f = fixture();
        let job = Job::new(JobKind::Async, "missing", json!({}));
        f.store.insert(JobSet::Executable, job.clone()).unwrap();

        let err = f.manager.execute(&f.ctx, &job).unwrap_err();
        assert!(matches!(err, JobServiceError::HandlerMissing(_)));
        assert_eq!(f.store.count(JobSet::Executable), 1);
    }

    fn repeating_fixture() -> Fixture {
        let schedule =
            |_repeat: &str, base: chrono::DateTime<Utc>| Some(base + Duration::minutes(5));
        let mut registry = JobHandlerRegistry::new();
        registry.register_fn("test", |_job, _config, _ctx| Ok(()));
        fixture_with(registry, Arc::new(schedule))
    }

    #[test]
    fn repeating_timer_schedules_its_next_occurrence() {
        let f = repeating_fixture();

        let job = Job::new(JobKind::Timer, "test", json!({})).with_repeat("every-5m", Some(3));
        f.store.insert(JobSet::Executable, job.clone()).unwrap();

        f.manager.execute(&f.ctx, &job).unwrap();

        let timers = f.store.all(JobSet::Timer);
        assert_eq!(timers.len(), 1);
        let next = &timers[0];
        assert_ne!(next.id, job.id);
        assert_eq!(next.max_iterations, Some(2));
        assert!(next.due_date.unwrap() > Utc::now());
    }

    #[test]
    fn repetition_stops_at_end_date_and_exhausted_iterations() {
        let f = repeating_fixture();

        // Next occurrence would land past the end date.
        let ending = Job::new(JobKind::Timer, "test", json!({}))
            .with_repeat("every-5m", None)
            .with_end_date(Utc::now() + Duration::minutes(1));
        f.store.insert(JobSet::Executable, ending.clone()).unwrap();
        f.manager.execute(&f.ctx, &ending).unwrap();
        assert_eq!(f.store.count(JobSet::Timer), 0);

        // Last permitted iteration.
        let last = Job::new(JobKind::Timer, "test", json!({})).with_repeat("every-5m", Some(1));
        f.store.insert(JobSet::Executable, last.clone()).unwrap();
        f.manager.execute(&f.ctx, &last).unwrap();
        assert_eq!(f.store.count(JobSet::Timer), 0);
    }
}
