//! Core job records and the retry policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use importq_core::{ImportType, JobId, JobStatus, LogLevel, SourceId, UserId};

use crate::config::MAX_RETRIES;

/// A background import job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Source being imported
    pub source_id: SourceId,
    /// Full or delta import
    pub import_type: ImportType,
    /// Current status
    pub status: JobStatus,
    /// Who requested the import
    pub created_by: UserId,
    /// Items the processor expects to handle (0 until reported)
    pub total_items: u64,
    /// Items handled so far
    pub processed_items: u64,
    /// Failed attempts so far; never decreases
    pub error_count: u32,
    /// Number of successful claims; fences writes from abandoned attempts
    pub attempt: u32,
    /// Opaque processor-defined resume token
    pub last_checkpoint: Option<String>,
    /// When the job was enqueued (FIFO key)
    pub created_at: DateTime<Utc>,
    /// When the current or last attempt was claimed
    pub started_at: Option<DateTime<Utc>>,
    /// Set on terminal states only
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(source_id: SourceId, import_type: ImportType, created_by: UserId) -> Self {
        Self {
            id: JobId::new(),
            source_id,
            import_type,
            status: JobStatus::Queued,
            created_by,
            total_items: 0,
            processed_items: 0,
            error_count: 0,
            attempt: 0,
            last_checkpoint: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Append-only log line attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: Uuid,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl JobLog {
    pub fn new(
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            level,
            message: message.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of one failed attempt (or one failed item).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub id: Uuid,
    pub job_id: JobId,
    /// Where the failure happened (e.g. `fetch`, `parse`, `upsert`)
    pub stage: String,
    pub message: String,
    pub code: Option<String>,
    /// Identifier of the offending item in the source (SKU, row number)
    pub external_id: Option<String>,
    /// Job error count at the time this row was written
    pub retry_count: u32,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl JobError {
    pub fn new(job_id: JobId, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            stage: stage.into(),
            message: message.into(),
            code: None,
            external_id: None,
            retry_count: 0,
            resolved: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn with_external_id(mut self, external_id: Option<String>) -> Self {
        self.external_id = external_id;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Conditional status change applied when an attempt settles.
///
/// Stores apply it only while the job is `running` at the settling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `running → success`, `finished_at = now`
    Succeeded,
    /// `running → queued`, `finished_at` cleared
    Requeued { error_count: u32 },
    /// `running → failed`, `finished_at = now`
    Failed { error_count: u32 },
}

impl Transition {
    pub fn status(&self) -> JobStatus {
        match self {
            Transition::Succeeded => JobStatus::Success,
            Transition::Requeued { .. } => JobStatus::Queued,
            Transition::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Error count after the transition, given the count before it.
    pub fn error_count(&self, current: u32) -> u32 {
        match self {
            Transition::Succeeded => current,
            Transition::Requeued { error_count } | Transition::Failed { error_count } => {
                *error_count
            }
        }
    }

    pub fn sets_finished_at(&self) -> bool {
        self.status().is_terminal()
    }
}

/// What to do with a job whose processor just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Put the job back in the queue
    Retry { error_count: u32 },
    /// Retry ceiling reached
    Exhausted { error_count: u32 },
}

impl FailureDecision {
    pub fn error_count(&self) -> u32 {
        match self {
            FailureDecision::Retry { error_count } | FailureDecision::Exhausted { error_count } => {
                *error_count
            }
        }
    }

    pub fn into_transition(self) -> Transition {
        match self {
            FailureDecision::Retry { error_count } => Transition::Requeued { error_count },
            FailureDecision::Exhausted { error_count } => Transition::Failed { error_count },
        }
    }
}

/// Retry policy configuration.
///
/// Requeued jobs go back to the FIFO queue immediately; there is no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts allowed before the job is terminally failed
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide the fate of a job that failed with `error_count` prior failures.
    pub fn on_failure(&self, error_count: u32) -> FailureDecision {
        let error_count = error_count.saturating_add(1);
        if error_count < self.max_retries {
            FailureDecision::Retry { error_count }
        } else {
            FailureDecision::Exhausted { error_count }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_allows_three_attempts() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.on_failure(0), FailureDecision::Retry { error_count: 1 });
        assert_eq!(policy.on_failure(1), FailureDecision::Retry { error_count: 2 });
        assert_eq!(policy.on_failure(2), FailureDecision::Exhausted { error_count: 3 });
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy::new(1);
        assert_eq!(policy.on_failure(0), FailureDecision::Exhausted { error_count: 1 });
    }

    #[test]
    fn transitions_map_to_statuses() {
        assert_eq!(Transition::Succeeded.status(), JobStatus::Success);
        assert_eq!(Transition::Requeued { error_count: 1 }.status(), JobStatus::Queued);
        assert_eq!(Transition::Failed { error_count: 3 }.status(), JobStatus::Failed);

        assert!(Transition::Succeeded.sets_finished_at());
        assert!(!Transition::Requeued { error_count: 1 }.sets_finished_at());
        assert_eq!(Transition::Succeeded.error_count(2), 2);
    }

    #[test]
    fn new_job_is_queued_and_untouched() {
        let job = Job::new(SourceId::new(), ImportType::Full, UserId::new());

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.error_count, 0);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());
        assert!(job.last_checkpoint.is_none());
    }

    proptest! {
        #[test]
        fn error_count_grows_by_one_per_failure(max in 1u32..20, prior in 0u32..40) {
            let decision = RetryPolicy::new(max).on_failure(prior);
            prop_assert_eq!(decision.error_count(), prior + 1);
        }

        #[test]
        fn failing_every_attempt_exhausts_exactly_at_ceiling(max in 1u32..20) {
            let policy = RetryPolicy::new(max);
            let mut error_count = 0;
            let mut attempts = 0;
            loop {
                attempts += 1;
                match policy.on_failure(error_count) {
                    FailureDecision::Retry { error_count: n } => error_count = n,
                    FailureDecision::Exhausted { error_count: n } => {
                        error_count = n;
                        break;
                    }
                }
            }
            prop_assert_eq!(error_count, max);
            prop_assert_eq!(attempts, max);
        }
    }
}
