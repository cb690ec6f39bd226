//! Bulk lock release for one instance's rows.

use tracing::debug;

use forgeflow_core::JobServiceResult;

use crate::command::{Command, CommandContext};

/// Clear every lock held by `lock_owner` across the timer and executable
/// sets. Used for crash-recovery cleanup at startup and optionally again at
/// shutdown.
///
/// The clear is in place — no identity rotation — because nothing is
/// contending for rows this instance owns; the jobs just return to the
/// acquirable pool.
#[derive(Debug, Clone)]
pub struct UnacquireOwnedJobsCmd {
    pub lock_owner: String,
}

impl Command<usize> for UnacquireOwnedJobsCmd {
    fn execute(&self, ctx: &CommandContext) -> JobServiceResult<usize> {
        let owned = ctx.store().find_jobs_by_lock_owner(&self.lock_owner)?;
        let mut released = 0;

        for (set, mut job) in owned {
            job.clear_lock();
            match ctx.store().update(set, &mut job) {
                Ok(()) => released += 1,
                Err(error) if error.is_optimistic_locking() => {
                    debug!(job_id = %job.id, set = %set, "owned job changed while unlocking");
                }
                Err(error) => return Err(error.into()),
            }
        }

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandContext, CommandExecutor};
    use crate::handler::{JobHandlerRegistry, NoRepeat};
    use crate::manager::JobManager;
    use crate::store::{InMemoryJobStore, JobStore};
    use chrono::{Duration, Utc};
    use forgeflow_core::{Job, JobKind, JobSet};
    use forgeflow_events::InMemoryEventBus;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn releases_only_this_owners_locks() {
        let store = InMemoryJobStore::arc();
        let manager = Arc::new(JobManager::new(
            Arc::new(JobHandlerRegistry::new()),
            Arc::new(NoRepeat),
        ));
        let ctx = CommandContext::new(store.clone(), Arc::new(InMemoryEventBus::new()), manager);
        let executor = CommandExecutor::new(Arc::new(ctx));

        let mut mine = Job::new(JobKind::Async, "test", json!({}));
        mine.lock("node-a", Utc::now() + Duration::hours(1));
        store.insert(JobSet::Executable, mine.clone()).unwrap();

        let mut theirs = Job::new(JobKind::Timer, "test", json!({}));
        theirs.lock("node-b", Utc::now() + Duration::hours(1));
        store.insert(JobSet::Timer, theirs.clone()).unwrap();

        let released = executor
            .execute(UnacquireOwnedJobsCmd {
                lock_owner: "node-a".to_string(),
            })
            .unwrap();

        assert_eq!(released, 1);
        let mine_after = store.find(JobSet::Executable, mine.id).unwrap().unwrap();
        assert!(mine_after.lock_owner.is_none());
        let theirs_after = store.find(JobSet::Timer, theirs.id).unwrap().unwrap();
        assert_eq!(theirs_after.lock_owner.as_deref(), Some("node-b"));
    }
}
