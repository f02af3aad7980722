//! Job storage: the persistence port and its in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use importq_core::{JobId, JobStatus};

use super::types::{Job, JobError, JobLog, Transition};

/// Job store abstraction.
///
/// Every status change goes through a conditional update that reports the
/// number of affected rows. Callers treat `0` as "someone else moved the
/// job first", never as an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly enqueued job.
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Get a job by ID.
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// ID of the oldest `queued` job (by `created_at`, then id), if any.
    async fn find_oldest_queued(&self) -> Result<Option<JobId>, StoreError>;

    /// `queued → running` if and only if the job is still `queued`.
    ///
    /// Sets `started_at` and increments `attempt`. Returns the row as written
    /// by this claim, or `None` when it affected no row (someone else won).
    async fn claim(&self, job_id: JobId, started_at: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// `running → queued` if the job is `running` at `attempt`.
    ///
    /// Hands back a claim that was never dispatched. `error_count` is left
    /// alone; `attempt` keeps its bumped value so later writes stay fenced.
    /// Returns affected rows (0 or 1).
    async fn release(&self, job_id: JobId, attempt: u32) -> Result<u64, StoreError>;

    /// Apply `transition` if the job is `running` at `attempt`.
    ///
    /// Returns affected rows (0 or 1).
    async fn finalize(
        &self,
        job_id: JobId,
        attempt: u32,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Write item counters.
    ///
    /// With `fence = Some(attempt)` the write only lands while the job is
    /// `running` at that attempt. Returns affected rows (0 or 1).
    async fn update_progress(
        &self,
        job_id: JobId,
        fence: Option<u32>,
        processed_items: u64,
        total_items: u64,
    ) -> Result<u64, StoreError>;

    /// Write the resume token. Fencing as for [`JobStore::update_progress`].
    async fn update_checkpoint(
        &self,
        job_id: JobId,
        fence: Option<u32>,
        checkpoint: &str,
    ) -> Result<u64, StoreError>;

    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError>;

    async fn append_error(&self, error: &JobError) -> Result<(), StoreError>;

    /// Log lines for a job, oldest first.
    async fn list_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, StoreError>;

    /// Error rows for a job, oldest first.
    async fn list_errors(&self, job_id: JobId) -> Result<Vec<JobError>, StoreError>;

    /// Jobs oldest first, optionally filtered by status.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Job counts per status.
    async fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt row: {0}")]
    Decode(String),
    #[error("{field} out of range for storage: {value}")]
    OutOfRange { field: &'static str, value: u64 },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Running => self.running += count,
            JobStatus::Success => self.success += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.success + self.failed
    }
}

#[derive(Debug)]
struct StoredJob {
    // Insertion order; breaks `created_at` ties deterministically.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Tables {
    next_seq: u64,
    jobs: HashMap<JobId, StoredJob>,
    logs: Vec<JobLog>,
    errors: Vec<JobError>,
}

impl Tables {
    fn running_at(&mut self, job_id: JobId, fence: Option<u32>) -> Option<&mut Job> {
        let stored = self.jobs.get_mut(&job_id)?;
        match fence {
            None => Some(&mut stored.job),
            Some(attempt)
                if stored.job.status == JobStatus::Running && stored.job.attempt == attempt =>
            {
                Some(&mut stored.job)
            }
            Some(_) => None,
        }
    }
}

/// In-memory job store for tests/dev.
///
/// A single `RwLock` over all three tables makes each conditional update
/// atomic, which is what the claim protocol relies on.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut tables = self.write();
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let seq = tables.next_seq;
        tables.next_seq += 1;
        tables.jobs.insert(
            job.id,
            StoredJob {
                seq,
                job: job.clone(),
            },
        );
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read().jobs.get(&job_id).map(|s| s.job.clone()))
    }

    async fn find_oldest_queued(&self) -> Result<Option<JobId>, StoreError> {
        let tables = self.read();
        Ok(tables
            .jobs
            .values()
            .filter(|s| s.job.status == JobStatus::Queued)
            .min_by_key(|s| (s.job.created_at, s.seq))
            .map(|s| s.job.id))
    }

    async fn claim(&self, job_id: JobId, started_at: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut tables = self.write();
        match tables.jobs.get_mut(&job_id) {
            Some(stored) if stored.job.status.can_transition_to(JobStatus::Running) => {
                stored.job.status = JobStatus::Running;
                stored.job.started_at = Some(started_at);
                stored.job.attempt += 1;
                Ok(Some(stored.job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, job_id: JobId, attempt: u32) -> Result<u64, StoreError> {
        let mut tables = self.write();
        let Some(job) = tables.running_at(job_id, Some(attempt)) else {
            return Ok(0);
        };
        job.status = JobStatus::Queued;
        job.started_at = None;
        Ok(1)
    }

    async fn finalize(
        &self,
        job_id: JobId,
        attempt: u32,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write();
        let Some(job) = tables.running_at(job_id, Some(attempt)) else {
            return Ok(0);
        };
        if !job.status.can_transition_to(transition.status()) {
            return Ok(0);
        }

        job.status = transition.status();
        job.error_count = transition.error_count(job.error_count);
        job.finished_at = transition.sets_finished_at().then_some(at);
        Ok(1)
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        fence: Option<u32>,
        processed_items: u64,
        total_items: u64,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write();
        let Some(job) = tables.running_at(job_id, fence) else {
            return Ok(0);
        };
        job.processed_items = processed_items;
        job.total_items = total_items;
        Ok(1)
    }

    async fn update_checkpoint(
        &self,
        job_id: JobId,
        fence: Option<u32>,
        checkpoint: &str,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write();
        let Some(job) = tables.running_at(job_id, fence) else {
            return Ok(0);
        };
        job.last_checkpoint = Some(checkpoint.to_string());
        Ok(1)
    }

    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError> {
        let mut tables = self.write();
        if !tables.jobs.contains_key(&log.job_id) {
            return Err(StoreError::NotFound(log.job_id));
        }
        tables.logs.push(log.clone());
        Ok(())
    }

    async fn append_error(&self, error: &JobError) -> Result<(), StoreError> {
        let mut tables = self.write();
        if !tables.jobs.contains_key(&error.job_id) {
            return Err(StoreError::NotFound(error.job_id));
        }
        tables.errors.push(error.clone());
        Ok(())
    }

    async fn list_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, StoreError> {
        Ok(self
            .read()
            .logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_errors(&self, job_id: JobId) -> Result<Vec<JobError>, StoreError> {
        Ok(self
            .read()
            .errors
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.read();
        let mut result: Vec<_> = tables
            .jobs
            .values()
            .filter(|s| status.is_none_or(|st| s.job.status == st))
            .collect();

        result.sort_by_key(|s| (s.job.created_at, s.seq));
        Ok(result
            .into_iter()
            .take(limit)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let tables = self.read();
        let mut stats = JobStats::default();
        for stored in tables.jobs.values() {
            stats.record(stored.job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use importq_core::{ImportType, LogLevel, SourceId, UserId};

    fn new_job() -> Job {
        Job::new(SourceId::new(), ImportType::Full, UserId::new())
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_job(&job).await.unwrap();

        let candidate = store.find_oldest_queued().await.unwrap().unwrap();
        assert_eq!(candidate, job.id);

        let returned = store.claim(candidate, Utc::now()).await.unwrap().unwrap();

        let claimed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(returned, claimed);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);
        assert!(claimed.started_at.is_some());

        // No more jobs
        assert!(store.find_oldest_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_claim_on_same_job_affects_nothing() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_job(&job).await.unwrap();

        // Both workers saw the same candidate before either wrote.
        let seen_by_a = store.find_oldest_queued().await.unwrap().unwrap();
        let seen_by_b = store.find_oldest_queued().await.unwrap().unwrap();
        assert_eq!(seen_by_a, seen_by_b);

        let a = store.claim(seen_by_a, Utc::now()).await.unwrap();
        let b = store.claim(seen_by_b, Utc::now()).await.unwrap();
        assert!(a.is_some_and(|j| j.attempt == 1));
        assert!(b.is_none());
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn oldest_queued_is_fifo() {
        let store = InMemoryJobStore::new();
        let first = new_job();
        let second = new_job();
        store.insert_job(&first).await.unwrap();
        store.insert_job(&second).await.unwrap();

        assert_eq!(store.find_oldest_queued().await.unwrap(), Some(first.id));
        store.claim(first.id, Utc::now()).await.unwrap();
        assert_eq!(store.find_oldest_queued().await.unwrap(), Some(second.id));
    }

    #[tokio::test]
    async fn release_returns_undispatched_claim_to_queue() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_job(&job).await.unwrap();
        let claimed = store.claim(job.id, Utc::now()).await.unwrap().unwrap();

        // Wrong attempt leaves the claim alone.
        assert_eq!(store.release(job.id, claimed.attempt + 1).await.unwrap(), 0);
        assert_eq!(store.release(job.id, claimed.attempt).await.unwrap(), 1);

        let released = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(released.status, JobStatus::Queued);
        assert_eq!(released.attempt, 1);
        assert_eq!(released.error_count, 0);
        assert!(released.started_at.is_none());
        assert_eq!(store.find_oldest_queued().await.unwrap(), Some(job.id));

        // Already queued: nothing to release.
        assert_eq!(store.release(job.id, claimed.attempt).await.unwrap(), 0);

        let reclaimed = store.claim(job.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt, 2);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_job(&job).await.unwrap();
        assert!(matches!(
            store.insert_job(&job).await,
            Err(StoreError::AlreadyExists(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn finalize_requires_running_at_attempt() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_job(&job).await.unwrap();

        // Not running yet.
        assert_eq!(
            store
                .finalize(job.id, 1, Transition::Succeeded, Utc::now())
                .await
                .unwrap(),
            0
        );

        store.claim(job.id, Utc::now()).await.unwrap();

        // Wrong attempt.
        assert_eq!(
            store
                .finalize(job.id, 2, Transition::Succeeded, Utc::now())
                .await
                .unwrap(),
            0
        );

        assert_eq!(
            store
                .finalize(job.id, 1, Transition::Requeued { error_count: 1 }, Utc::now())
                .await
                .unwrap(),
            1
        );
        let requeued = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.error_count, 1);
        assert!(requeued.finished_at.is_none());

        // Already moved on; a late finalize does nothing.
        assert_eq!(
            store
                .finalize(job.id, 1, Transition::Failed { error_count: 2 }, Utc::now())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn fenced_progress_rejects_stale_attempt() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_job(&job).await.unwrap();
        store.claim(job.id, Utc::now()).await.unwrap();
        store
            .finalize(job.id, 1, Transition::Requeued { error_count: 1 }, Utc::now())
            .await
            .unwrap();
        store.claim(job.id, Utc::now()).await.unwrap();

        assert_eq!(store.update_checkpoint(job.id, Some(1), "row:10").await.unwrap(), 0);
        assert_eq!(store.update_checkpoint(job.id, Some(2), "row:20").await.unwrap(), 1);
        assert_eq!(store.update_progress(job.id, Some(1), 5, 50).await.unwrap(), 0);
        assert_eq!(store.update_progress(job.id, None, 7, 70).await.unwrap(), 1);

        let current = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.last_checkpoint.as_deref(), Some("row:20"));
        assert_eq!((current.processed_items, current.total_items), (7, 70));
    }

    #[tokio::test]
    async fn logs_and_errors_are_per_job_in_order() {
        let store = InMemoryJobStore::new();
        let a = new_job();
        let b = new_job();
        store.insert_job(&a).await.unwrap();
        store.insert_job(&b).await.unwrap();

        store.append_log(&JobLog::new(a.id, LogLevel::Info, "one", None)).await.unwrap();
        store.append_log(&JobLog::new(b.id, LogLevel::Info, "other", None)).await.unwrap();
        store.append_log(&JobLog::new(a.id, LogLevel::Warn, "two", None)).await.unwrap();
        store.append_error(&JobError::new(a.id, "parse", "bad row")).await.unwrap();

        let logs = store.list_logs(a.id).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two"]);
        assert_eq!(store.list_errors(a.id).await.unwrap().len(), 1);
        assert!(store.list_errors(b.id).await.unwrap().is_empty());

        let orphan = JobLog::new(JobId::new(), LogLevel::Info, "nobody", None);
        assert!(matches!(store.append_log(&orphan).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn stats_and_listing_follow_status() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = new_job();
            ids.push(job.id);
            store.insert_job(&job).await.unwrap();
        }

        store.claim(ids[0], Utc::now()).await.unwrap();
        store.claim(ids[1], Utc::now()).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.total(), 5);

        let running = store.list_jobs(Some(JobStatus::Running), 10).await.unwrap();
        assert_eq!(running.iter().map(|j| j.id).collect::<Vec<_>>(), vec![ids[0], ids[1]]);
        assert_eq!(store.list_jobs(None, 2).await.unwrap().len(), 2);
    }
}
