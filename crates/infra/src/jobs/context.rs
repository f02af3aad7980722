//! Processor-facing handle and the processor trait.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use importq_core::{JobId, LogLevel};

use super::error::{ImportFailure, QueueError};
use super::store::JobStore;
use super::types::{Job, JobError, JobLog};

/// Business-specific import work.
///
/// The queue calls `process` once per claimed attempt. The processor should
/// check [`JobContext::is_cancelled`] (or await [`JobContext::cancelled`])
/// between units of work; cancellation is never forced.
#[async_trait]
pub trait ImportProcessor: Send + Sync + 'static {
    async fn process(&self, ctx: JobContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> ImportProcessor for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Handle given to the processor for one attempt of one job.
///
/// Progress and checkpoint writes are fenced by the attempt: once the job has
/// left `running` or been claimed again, they fail with
/// [`QueueError::StaleAttempt`] instead of overwriting newer state.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    cancel: CancellationToken,
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("attempt", &self.job.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobContext {
    pub(crate) fn new(job: Job, cancel: CancellationToken, store: Arc<dyn JobStore>) -> Self {
        Self { job, cancel, store }
    }

    /// The job record as it was right after the claim.
    ///
    /// `last_checkpoint` holds the resume point left by earlier attempts.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn checkpoint(&self) -> Option<&str> {
        self.job.last_checkpoint.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the queue has asked this attempt to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record item counters for this attempt.
    pub async fn update_progress(&self, processed_items: u64, total_items: u64) -> Result<(), QueueError> {
        let affected = self
            .store
            .update_progress(self.job.id, Some(self.job.attempt), processed_items, total_items)
            .await?;
        self.fenced(affected)
    }

    /// Persist a resume token for this attempt.
    pub async fn update_checkpoint(&self, checkpoint: impl AsRef<str>) -> Result<(), QueueError> {
        let affected = self
            .store
            .update_checkpoint(self.job.id, Some(self.job.attempt), checkpoint.as_ref())
            .await?;
        self.fenced(affected)
    }

    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let entry = JobLog::new(self.job.id, level, message, details);
        self.store.append_log(&entry).await?;
        Ok(())
    }

    /// Record a per-item failure without failing the attempt.
    pub async fn log_error(&self, failure: &ImportFailure) -> Result<(), QueueError> {
        let row = JobError::new(self.job.id, failure.stage.clone(), failure.message.clone())
            .with_code(failure.code.clone())
            .with_external_id(failure.external_id.clone())
            .with_retry_count(self.job.error_count);
        self.store.append_error(&row).await?;
        Ok(())
    }

    fn fenced(&self, affected: u64) -> Result<(), QueueError> {
        if affected == 0 {
            warn!(
                job_id = %self.job.id,
                attempt = self.job.attempt,
                "write from stale attempt rejected"
            );
            return Err(QueueError::StaleAttempt {
                job_id: self.job.id,
                attempt: self.job.attempt,
            });
        }
        Ok(())
    }
}
