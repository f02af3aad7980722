//! Polling import queue: claim, dispatch, settle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use importq_core::{ImportType, JobId, JobStatus, LogLevel, SourceId, UserId};

use crate::config::QueueConfig;

use super::context::{ImportProcessor, JobContext};
use super::error::{ImportFailure, QueueError};
use super::store::{JobStats, JobStore};
use super::types::{FailureDecision, Job, JobError, JobLog, RetryPolicy, Transition};

/// Background import queue.
///
/// Polls a job store for queued jobs, runs them with the registered processor
/// on spawned tasks, and resolves each attempt into success, requeue or
/// terminal failure.
///
/// Cloning is cheap and every clone drives the same instance. Separate
/// instances (in one process or many) may share a store: the conditional
/// claim in [`JobStore::claim`] is the only mutual exclusion between them.
#[derive(Clone)]
pub struct ImportQueue {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    policy: RetryPolicy,
    processor: RwLock<Option<Arc<dyn ImportProcessor>>>,
    running: AtomicBool,
    // Bumped by every `stop()` before it drains `active`; a cycle that saw an
    // older value must not start tracking the job it claimed.
    stops: AtomicU64,
    // Cancels the sleep of the current poll loop.
    poll_shutdown: Mutex<Option<CancellationToken>>,
    active: Mutex<HashMap<JobId, ActiveJob>>,
}

#[derive(Debug, Clone)]
struct ActiveJob {
    attempt: u32,
    cancel: CancellationToken,
}

/// Removes an execution from the tracking map when the execution ends.
///
/// Only removes the entry of its own attempt: after a requeue the same job
/// may already be tracked again for a newer attempt.
struct TrackingGuard {
    inner: Arc<Inner>,
    job_id: JobId,
    attempt: u32,
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active();
        if active.get(&self.job_id).is_some_and(|a| a.attempt == self.attempt) {
            active.remove(&self.job_id);
        }
    }
}

/// How an attempt ended, as seen at settlement time.
#[derive(Debug)]
enum Settlement {
    Completed,
    Cancelled,
    Errored(anyhow::Error),
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<JobId, ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processor(&self) -> Option<Arc<dyn ImportProcessor>> {
        self.processor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for ImportQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportQueue")
            .field("name", &self.inner.config.name)
            .field("running", &self.is_running())
            .field("active", &self.active_count())
            .finish()
    }
}

impl ImportQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        let policy = RetryPolicy::new(config.max_retries);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                policy,
                processor: RwLock::new(None),
                running: AtomicBool::new(false),
                stops: AtomicU64::new(0),
                poll_shutdown: Mutex::new(None),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Install the processor. Until one is registered the queue never claims.
    pub fn register_processor<P: ImportProcessor>(&self, processor: P) {
        let mut slot = self
            .inner
            .processor
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!(queue = %self.inner.config.name, "replacing registered import processor");
        }
        *slot = Some(Arc::new(processor));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of executions currently tracked by this instance.
    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    /// IDs of the executions currently tracked by this instance.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.inner.active().keys().copied().collect()
    }

    /// Start the poll loop on the current tokio runtime.
    ///
    /// Calling `start` on a running queue is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            info!(queue = %self.inner.config.name, "import queue already running");
            return;
        }

        let shutdown = CancellationToken::new();
        {
            let mut slot = self
                .inner
                .poll_shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = slot.replace(shutdown.clone()) {
                previous.cancel();
            }
        }

        let queue = self.clone();
        tokio::spawn(async move { queue.poll_loop(shutdown).await });
    }

    /// Stop polling and ask every tracked execution to cancel.
    ///
    /// Returns immediately. Cancellation is cooperative: a processor that
    /// never checks its token keeps running until it settles on its own, and
    /// is then recorded as cancelled.
    pub fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        self.inner.stops.fetch_add(1, Ordering::SeqCst);

        if let Some(shutdown) = self
            .inner
            .poll_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            shutdown.cancel();
        }

        let drained: Vec<(JobId, ActiveJob)> = self.inner.active().drain().collect();
        for (job_id, active) in &drained {
            debug!(job_id = %job_id, attempt = active.attempt, "cancelling execution");
            active.cancel.cancel();
        }

        if was_running || !drained.is_empty() {
            info!(
                queue = %self.inner.config.name,
                cancelled = drained.len(),
                "import queue stopped"
            );
        }
    }

    async fn poll_loop(self, shutdown: CancellationToken) {
        info!(
            queue = %self.inner.config.name,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            concurrent_jobs = self.inner.config.concurrent_jobs,
            "import queue started"
        );

        while self.is_running() && !shutdown.is_cancelled() {
            if let Err(e) = self.poll_cycle(Some(&shutdown)).await {
                error!(queue = %self.inner.config.name, error = %e, "poll cycle failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }

        debug!(queue = %self.inner.config.name, "poll loop exited");
    }

    /// Run one claim-and-dispatch cycle.
    ///
    /// Returns the dispatched job, or `None` when there is no processor, no
    /// free slot, no queued job, or the claim was lost to another worker.
    /// A `stop()` that lands while the cycle is claiming hands the claimed
    /// job back to the queue instead of running it.
    pub async fn poll_once(&self) -> Result<Option<JobId>, QueueError> {
        self.poll_cycle(None).await
    }

    async fn poll_cycle(
        &self,
        shutdown: Option<&CancellationToken>,
    ) -> Result<Option<JobId>, QueueError> {
        let generation = self.inner.stops.load(Ordering::SeqCst);

        let Some(processor) = self.inner.processor() else {
            debug!(queue = %self.inner.config.name, "no processor registered; skipping claim");
            return Ok(None);
        };

        if self.active_count() >= self.inner.config.concurrent_jobs {
            return Ok(None);
        }

        let Some(job) = self.claim_next().await? else {
            return Ok(None);
        };

        match self.dispatch(job, processor, generation, shutdown) {
            Ok(job_id) => Ok(Some(job_id)),
            Err(job) => {
                self.release_claim(&job).await?;
                Ok(None)
            }
        }
    }

    /// Claim the oldest queued job.
    ///
    /// The claim is a compare-and-swap on the status; losing the race to
    /// another worker yields `Ok(None)`. The returned job is the row written
    /// by the claim itself, so a successful claim never depends on a second
    /// read.
    pub async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let store = &self.inner.store;

        let Some(candidate) = store.find_oldest_queued().await? else {
            return Ok(None);
        };

        let Some(job) = store.claim(candidate, Utc::now()).await? else {
            debug!(job_id = %candidate, "claim lost to another worker");
            return Ok(None);
        };

        info!(job_id = %job.id, attempt = job.attempt, source_id = %job.source_id, "claimed import job");
        Ok(Some(job))
    }

    /// Start tracking and running `job`, unless the queue was stopped since
    /// the cycle began; the job is then handed back untouched in `Err`.
    fn dispatch(
        &self,
        job: Job,
        processor: Arc<dyn ImportProcessor>,
        generation: u64,
        shutdown: Option<&CancellationToken>,
    ) -> Result<JobId, Job> {
        let cancel = CancellationToken::new();
        {
            // Checked under the same lock `stop()` drains with: either the
            // drain sees this entry, or this check sees the stop.
            let mut active = self.inner.active();
            let stopped = self.inner.stops.load(Ordering::SeqCst) != generation
                || shutdown.is_some_and(CancellationToken::is_cancelled);
            if stopped {
                return Err(job);
            }
            active.insert(
                job.id,
                ActiveJob {
                    attempt: job.attempt,
                    cancel: cancel.clone(),
                },
            );
        }

        let job_id = job.id;
        let queue = self.clone();
        tokio::spawn(async move { queue.execute(job, processor, cancel).await });
        Ok(job_id)
    }

    async fn release_claim(&self, job: &Job) -> Result<(), QueueError> {
        let affected = self.inner.store.release(job.id, job.attempt).await?;
        if affected == 0 {
            warn!(job_id = %job.id, attempt = job.attempt, "claim moved before it could be released");
        } else {
            info!(
                queue = %self.inner.config.name,
                job_id = %job.id,
                attempt = job.attempt,
                "queue stopped during claim; job returned to queue"
            );
        }
        Ok(())
    }

    async fn execute(self, job: Job, processor: Arc<dyn ImportProcessor>, cancel: CancellationToken) {
        let _guard = TrackingGuard {
            inner: self.inner.clone(),
            job_id: job.id,
            attempt: job.attempt,
        };

        self.append_log(
            job.id,
            LogLevel::Info,
            format!("Import started (attempt {})", job.attempt),
            Some(json!({
                "attempt": job.attempt,
                "import_type": job.import_type,
                "resume_from": job.last_checkpoint,
            })),
        )
        .await;

        let ctx = JobContext::new(job.clone(), cancel.clone(), self.inner.store.clone());

        // A panic inside the processor surfaces as a JoinError here instead of
        // unwinding through the settlement logic.
        let outcome = match tokio::spawn(async move { processor.process(ctx).await }).await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow::anyhow!("processor panicked: {join_error}")),
        };

        let settlement = if cancel.is_cancelled() {
            Settlement::Cancelled
        } else {
            match outcome {
                Ok(()) => Settlement::Completed,
                Err(err) => Settlement::Errored(err),
            }
        };

        if let Err(e) = self.settle(&job, settlement).await {
            error!(job_id = %job.id, attempt = job.attempt, error = %e, "failed to settle import job");
        }
    }

    /// Resolve a finished attempt into exactly one conditional transition.
    async fn settle(&self, job: &Job, settlement: Settlement) -> Result<(), QueueError> {
        let store = &self.inner.store;
        let max_retries = self.inner.policy.max_retries;

        let (transition, level, message) = match settlement {
            Settlement::Completed => (
                Transition::Succeeded,
                LogLevel::Info,
                "Import completed".to_string(),
            ),
            Settlement::Cancelled => (
                Transition::Failed {
                    error_count: job.error_count,
                },
                LogLevel::Warn,
                "Import cancelled".to_string(),
            ),
            Settlement::Errored(err) => {
                let failure = ImportFailure::from_error(&err);
                let decision = self.inner.policy.on_failure(job.error_count);

                let row = JobError::new(job.id, failure.stage, failure.message.clone())
                    .with_code(failure.code)
                    .with_external_id(failure.external_id)
                    .with_retry_count(decision.error_count());
                store.append_error(&row).await?;

                let message = match decision {
                    FailureDecision::Retry { error_count } => format!(
                        "Import failed, will retry ({error_count}/{max_retries}): {}",
                        failure.message
                    ),
                    FailureDecision::Exhausted { error_count } => format!(
                        "Import failed permanently after {error_count} attempts: {}",
                        failure.message
                    ),
                };
                (decision.into_transition(), LogLevel::Error, message)
            }
        };

        let affected = store
            .finalize(job.id, job.attempt, transition, Utc::now())
            .await?;

        if affected == 0 {
            warn!(
                job_id = %job.id,
                attempt = job.attempt,
                status = %transition.status(),
                "job no longer running at this attempt; skipping transition"
            );
            return Ok(());
        }

        match level {
            LogLevel::Info => info!(job_id = %job.id, attempt = job.attempt, "{message}"),
            LogLevel::Warn => warn!(job_id = %job.id, attempt = job.attempt, "{message}"),
            LogLevel::Error => error!(job_id = %job.id, attempt = job.attempt, "{message}"),
        }

        let details = json!({
            "attempt": job.attempt,
            "status": transition.status(),
            "error_count": transition.error_count(job.error_count),
        });
        store
            .append_log(&JobLog::new(job.id, level, message, Some(details)))
            .await?;
        Ok(())
    }

    async fn append_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: String,
        details: Option<serde_json::Value>,
    ) {
        let entry = JobLog::new(job_id, level, message, details);
        if let Err(e) = self.inner.store.append_log(&entry).await {
            warn!(job_id = %job_id, error = %e, "failed to append job log");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enqueue and query API
    // ─────────────────────────────────────────────────────────────────────

    /// Create a job in `queued` state.
    pub async fn enqueue_job(
        &self,
        source_id: SourceId,
        import_type: ImportType,
        created_by: UserId,
    ) -> Result<Job, QueueError> {
        let job = Job::new(source_id, import_type, created_by);
        self.inner.store.insert_job(&job).await?;
        info!(job_id = %job.id, source_id = %source_id, import_type = %import_type, "enqueued import job");
        Ok(job)
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.store.get_job(job_id).await?)
    }

    pub async fn get_job_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, QueueError> {
        Ok(self.inner.store.list_logs(job_id).await?)
    }

    pub async fn get_job_errors(&self, job_id: JobId) -> Result<Vec<JobError>, QueueError> {
        Ok(self.inner.store.list_errors(job_id).await?)
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.inner.store.list_jobs(status, limit).await?)
    }

    pub async fn job_stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.inner.store.stats().await?)
    }

    /// Write item counters by job id, without an attempt fence.
    ///
    /// Processors should prefer [`JobContext::update_progress`].
    pub async fn update_progress(
        &self,
        job_id: JobId,
        processed_items: u64,
        total_items: u64,
    ) -> Result<(), QueueError> {
        let affected = self
            .inner
            .store
            .update_progress(job_id, None, processed_items, total_items)
            .await?;
        if affected == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    /// Write the resume token by job id, without an attempt fence.
    ///
    /// Processors should prefer [`JobContext::update_checkpoint`].
    pub async fn update_checkpoint(&self, job_id: JobId, checkpoint: &str) -> Result<(), QueueError> {
        let affected = self
            .inner
            .store
            .update_checkpoint(job_id, None, checkpoint)
            .await?;
        if affected == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    pub async fn log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let entry = JobLog::new(job_id, level, message, details);
        self.inner.store.append_log(&entry).await?;
        Ok(())
    }

    pub async fn log_error(
        &self,
        job_id: JobId,
        stage: &str,
        message: &str,
        code: Option<&str>,
        external_id: Option<&str>,
    ) -> Result<(), QueueError> {
        let error_count = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .map(|j| j.error_count)
            .unwrap_or_default();
        let row = JobError::new(job_id, stage, message)
            .with_code(code.map(str::to_string))
            .with_external_id(external_id.map(str::to_string))
            .with_retry_count(error_count);
        self.inner.store.append_error(&row).await?;
        Ok(())
    }
}
