//! Job storage abstraction and the in-memory reference implementation.
//!
//! The store holds the four disjoint record sets plus the scope-lock table
//! used for exclusive execution and the optional global acquisition lock.
//! All concurrency control is optimistic: updates and deletes carry the
//! revision the caller read, and a mismatch surfaces as
//! [`JobStoreError::OptimisticLocking`] — routine in a cluster, handled by
//! yielding the row.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use forgeflow_core::{Job, JobId, JobServiceError, JobSet};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// The record's revision changed since it was read; a concurrent writer
    /// won the race.
    #[error("optimistic locking failure: {0}")]
    OptimisticLocking(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, Self::OptimisticLocking(_))
    }
}

impl From<JobStoreError> for JobServiceError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::OptimisticLocking(msg) => JobServiceError::OptimisticLocking(msg),
            JobStoreError::NotFound(id) => JobServiceError::JobNotFound(id),
            JobStoreError::AlreadyExists(id) => JobServiceError::AlreadyExists(id),
            JobStoreError::Storage(msg) => JobServiceError::Storage(msg),
        }
    }
}

/// Job store abstraction.
///
/// Each call is atomic on its own; multi-record invariants ("no job loss on
/// move failure") are upheld by caller-side operation ordering, mirroring a
/// transactional backend where each command runs in one transaction.
pub trait JobStore: Send + Sync {
    /// Insert a job into a set. Fails with [`JobStoreError::AlreadyExists`]
    /// if the id is already present in that set — during a move this means a
    /// concurrent acquirer inserted the destination row first, and the
    /// caller must leave its source row untouched. Source and destination
    /// may briefly both hold the id mid-move; the sets are disjoint again
    /// once the move's delete lands.
    fn insert(&self, set: JobSet, job: Job) -> Result<(), JobStoreError>;

    /// Delete a job, checking the caller's revision against the stored one.
    fn delete(&self, set: JobSet, job: &Job) -> Result<(), JobStoreError>;

    /// Update a job, checking the revision and bumping it on success. The
    /// caller's copy receives the new revision. This is the row-level lock
    /// write used by acquisition.
    fn update(&self, set: JobSet, job: &mut Job) -> Result<(), JobStoreError>;

    fn find(&self, set: JobSet, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Due, unlocked timer jobs ordered by due date ascending.
    fn find_due_timer_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Due-now (null or past due date), unlocked executable jobs, due-date
    /// order.
    fn find_due_executable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs in the timer and executable sets whose lock expiration has
    /// passed, paired with the set each row was found in.
    fn find_expired_jobs(
        &self,
        now: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<(JobSet, Job)>, JobStoreError>;

    /// Jobs in the timer and executable sets locked by the given owner.
    fn find_jobs_by_lock_owner(&self, owner: &str)
        -> Result<Vec<(JobSet, Job)>, JobStoreError>;

    /// Try to take a named scope lock. Returns `false` when another owner
    /// holds a live lock on the scope; an expired lock is taken over. The
    /// current holder may re-take its own lock to extend it.
    fn try_lock_scope(
        &self,
        scope: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Release a scope lock if held by the given owner; otherwise a no-op.
    fn unlock_scope(&self, scope: &str, owner: &str) -> Result<(), JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, set: JobSet, job: Job) -> Result<(), JobStoreError> {
        (**self).insert(set, job)
    }

    fn delete(&self, set: JobSet, job: &Job) -> Result<(), JobStoreError> {
        (**self).delete(set, job)
    }

    fn update(&self, set: JobSet, job: &mut Job) -> Result<(), JobStoreError> {
        (**self).update(set, job)
    }

    fn find(&self, set: JobSet, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find(set, id)
    }

    fn find_due_timer_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_due_timer_jobs(now, limit)
    }

    fn find_due_executable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_due_executable_jobs(now, limit)
    }

    fn find_expired_jobs(
        &self,
        now: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<(JobSet, Job)>, JobStoreError> {
        (**self).find_expired_jobs(now, page_size)
    }

    fn find_jobs_by_lock_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<(JobSet, Job)>, JobStoreError> {
        (**self).find_jobs_by_lock_owner(owner)
    }

    fn try_lock_scope(
        &self,
        scope: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).try_lock_scope(scope, owner, until)
    }

    fn unlock_scope(&self, scope: &str, owner: &str) -> Result<(), JobStoreError> {
        (**self).unlock_scope(scope, owner)
    }
}

#[derive(Debug, Clone)]
struct ScopeLock {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-memory job store for tests/dev.
///
/// One map per record set keeps the sets physically disjoint, like the
/// per-set tables of a SQL backend.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    timer: RwLock<HashMap<JobId, Job>>,
    executable: RwLock<HashMap<JobId, Job>>,
    suspended: RwLock<HashMap<JobId, Job>>,
    dead_letter: RwLock<HashMap<JobId, Job>>,
    scope_locks: RwLock<HashMap<String, ScopeLock>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn set(&self, set: JobSet) -> &RwLock<HashMap<JobId, Job>> {
        match set {
            JobSet::Timer => &self.timer,
            JobSet::Executable => &self.executable,
            JobSet::Suspended => &self.suspended,
            JobSet::DeadLetter => &self.dead_letter,
        }
    }

    /// Number of records currently in a set.
    pub fn count(&self, set: JobSet) -> usize {
        self.set(set).read().unwrap().len()
    }

    /// Snapshot of every record in a set, unordered.
    pub fn all(&self, set: JobSet) -> Vec<Job> {
        self.set(set).read().unwrap().values().cloned().collect()
    }

}

fn due_sort_key(job: &Job) -> DateTime<Utc> {
    job.due_date.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, set: JobSet, job: Job) -> Result<(), JobStoreError> {
        let mut records = self.set(set).write().unwrap();
        if records.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        records.insert(job.id, job);
        Ok(())
    }

    fn delete(&self, set: JobSet, job: &Job) -> Result<(), JobStoreError> {
        let mut records = self.set(set).write().unwrap();
        match records.get(&job.id) {
            Some(stored) if stored.revision == job.revision => {
                records.remove(&job.id);
                Ok(())
            }
            Some(stored) => Err(JobStoreError::OptimisticLocking(format!(
                "job {} revision {} != {}",
                job.id, job.revision, stored.revision
            ))),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn update(&self, set: JobSet, job: &mut Job) -> Result<(), JobStoreError> {
        let mut records = self.set(set).write().unwrap();
        match records.get(&job.id) {
            Some(stored) if stored.revision == job.revision => {
                job.revision += 1;
                records.insert(job.id, job.clone());
                Ok(())
            }
            Some(stored) => Err(JobStoreError::OptimisticLocking(format!(
                "job {} revision {} != {}",
                job.id, job.revision, stored.revision
            ))),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn find(&self, set: JobSet, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.set(set).read().unwrap().get(&id).cloned())
    }

    fn find_due_timer_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let records = self.timer.read().unwrap();
        let mut due: Vec<_> = records
            .values()
            .filter(|j| j.is_due(now) && !j.is_locked(now))
            .cloned()
            .collect();
        due.sort_by_key(due_sort_key);
        due.truncate(limit);
        Ok(due)
    }

    fn find_due_executable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let records = self.executable.read().unwrap();
        let mut due: Vec<_> = records
            .values()
            .filter(|j| j.is_due(now) && !j.is_locked(now))
            .cloned()
            .collect();
        due.sort_by_key(due_sort_key);
        due.truncate(limit);
        Ok(due)
    }

    fn find_expired_jobs(
        &self,
        now: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<(JobSet, Job)>, JobStoreError> {
        let mut expired = Vec::new();
        for set in [JobSet::Timer, JobSet::Executable] {
            let records = self.set(set).read().unwrap();
            expired.extend(
                records
                    .values()
                    .filter(|j| j.is_lock_expired(now))
                    .map(|j| (set, j.clone())),
            );
        }
        expired.sort_by_key(|(_, j)| j.lock_expiration_time);
        expired.truncate(page_size);
        Ok(expired)
    }

    fn find_jobs_by_lock_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<(JobSet, Job)>, JobStoreError> {
        let mut owned = Vec::new();
        for set in [JobSet::Timer, JobSet::Executable] {
            let records = self.set(set).read().unwrap();
            owned.extend(
                records
                    .values()
                    .filter(|j| j.lock_owner.as_deref() == Some(owner))
                    .map(|j| (set, j.clone())),
            );
        }
        Ok(owned)
    }

    fn try_lock_scope(
        &self,
        scope: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let now = Utc::now();
        let mut locks = self.scope_locks.write().unwrap();
        match locks.get(scope) {
            Some(held) if held.owner != owner && held.expires_at > now => Ok(false),
            _ => {
                locks.insert(
                    scope.to_string(),
                    ScopeLock {
                        owner: owner.to_string(),
                        expires_at: until,
                    },
                );
                Ok(true)
            }
        }
    }

    fn unlock_scope(&self, scope: &str, owner: &str) -> Result<(), JobStoreError> {
        let mut locks = self.scope_locks.write().unwrap();
        if locks.get(scope).is_some_and(|held| held.owner == owner) {
            locks.remove(scope);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use forgeflow_core::JobKind;

    fn timer_job(due_in_secs: i64) -> Job {
        Job::new(JobKind::Timer, "test", serde_json::json!({}))
            .with_due_date(Utc::now() + Duration::seconds(due_in_secs))
    }

    #[test]
    fn insert_rejects_duplicate_ids_within_a_set() {
        let store = InMemoryJobStore::new();
        let job = timer_job(-1);
        store.insert(JobSet::Timer, job.clone()).unwrap();

        assert!(matches!(
            store.insert(JobSet::Timer, job.clone()),
            Err(JobStoreError::AlreadyExists(_))
        ));

        // A move inserts into the destination before deleting the source,
        // so the same id may briefly exist in another set.
        store.insert(JobSet::Executable, job.clone()).unwrap();
        store.delete(JobSet::Timer, &job).unwrap();
        assert_eq!(store.count(JobSet::Timer), 0);
        assert_eq!(store.count(JobSet::Executable), 1);
    }

    #[test]
    fn update_bumps_revision_and_detects_stale_writers() {
        let store = InMemoryJobStore::new();
        let job = timer_job(-1);
        store.insert(JobSet::Timer, job.clone()).unwrap();

        let mut winner = job.clone();
        let mut loser = job.clone();

        winner.lock("instance-a", Utc::now() + Duration::hours(1));
        store.update(JobSet::Timer, &mut winner).unwrap();
        assert_eq!(winner.revision, job.revision + 1);

        loser.lock("instance-b", Utc::now() + Duration::hours(1));
        let err = store.update(JobSet::Timer, &mut loser).unwrap_err();
        assert!(err.is_optimistic_locking());
    }

    #[test]
    fn delete_checks_revision() {
        let store = InMemoryJobStore::new();
        let job = timer_job(-1);
        store.insert(JobSet::Timer, job.clone()).unwrap();

        let mut touched = job.clone();
        store.update(JobSet::Timer, &mut touched).unwrap();

        let err = store.delete(JobSet::Timer, &job).unwrap_err();
        assert!(err.is_optimistic_locking());

        store.delete(JobSet::Timer, &touched).unwrap();
        assert_eq!(store.count(JobSet::Timer), 0);
    }

    #[test]
    fn due_query_skips_locked_and_future_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store.insert(JobSet::Timer, timer_job(-10)).unwrap();
        store.insert(JobSet::Timer, timer_job(3600)).unwrap();

        let mut locked = timer_job(-10);
        locked.lock("instance-a", now + Duration::hours(1));
        store.insert(JobSet::Timer, locked).unwrap();

        let due = store.find_due_timer_jobs(now, 10).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn due_query_orders_by_due_date_and_respects_limit() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let late = timer_job(-1);
        let early = timer_job(-60);
        store.insert(JobSet::Timer, late.clone()).unwrap();
        store.insert(JobSet::Timer, early.clone()).unwrap();

        let due = store.find_due_timer_jobs(now, 1).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, early.id);
    }

    #[test]
    fn expired_query_spans_timer_and_executable_sets() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut expired_timer = timer_job(-10);
        expired_timer.lock("instance-a", now - Duration::seconds(5));
        store.insert(JobSet::Timer, expired_timer).unwrap();

        let mut expired_async = Job::new(JobKind::Async, "test", serde_json::json!({}));
        expired_async.lock("instance-a", now - Duration::seconds(1));
        store.insert(JobSet::Executable, expired_async).unwrap();

        let mut live = Job::new(JobKind::Async, "test", serde_json::json!({}));
        live.lock("instance-a", now + Duration::hours(1));
        store.insert(JobSet::Executable, live).unwrap();

        let expired = store.find_expired_jobs(now, 10).unwrap();
        assert_eq!(expired.len(), 2);

        let page = store.find_expired_jobs(now, 1).unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn scope_lock_blocks_other_owners_until_expired() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        assert!(store
            .try_lock_scope("proc-1", "instance-a", now + Duration::hours(1))
            .unwrap());
        // Holder may extend its own lock.
        assert!(store
            .try_lock_scope("proc-1", "instance-a", now + Duration::hours(2))
            .unwrap());
        assert!(!store
            .try_lock_scope("proc-1", "instance-b", now + Duration::hours(1))
            .unwrap());

        // Unlock by a non-holder is a no-op.
        store.unlock_scope("proc-1", "instance-b").unwrap();
        assert!(!store
            .try_lock_scope("proc-1", "instance-b", now + Duration::hours(1))
            .unwrap());

        store.unlock_scope("proc-1", "instance-a").unwrap();
        assert!(store
            .try_lock_scope("proc-1", "instance-b", now + Duration::hours(1))
            .unwrap());
    }

    #[test]
    fn expired_scope_lock_is_taken_over() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        assert!(store
            .try_lock_scope("proc-1", "instance-a", now - Duration::seconds(1))
            .unwrap());
        assert!(store
            .try_lock_scope("proc-1", "instance-b", now + Duration::hours(1))
            .unwrap());
    }
}
