//! Errors surfaced by the import queue API.

use importq_core::JobId;

use super::store::StoreError;

/// Import queue operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A write from an attempt that no longer owns the job.
    #[error("attempt {attempt} of job {job_id} no longer owns the job")]
    StaleAttempt { job_id: JobId, attempt: u32 },
}

/// Structured processor failure.
///
/// Processors return `anyhow::Error`; when the error is (or wraps) an
/// `ImportFailure`, its fields populate the job error row instead of the
/// generic `process` stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage}: {message}")]
pub struct ImportFailure {
    pub stage: String,
    pub message: String,
    pub code: Option<String>,
    pub external_id: Option<String>,
}

impl ImportFailure {
    /// Stage recorded for errors that are not an `ImportFailure`.
    pub const DEFAULT_STAGE: &'static str = "process";

    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            code: None,
            external_id: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Extract failure details from an arbitrary processor error.
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|e| e.downcast_ref::<ImportFailure>()) {
            Some(failure) => failure.clone(),
            None => Self::new(Self::DEFAULT_STAGE, format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn plain_errors_use_default_stage() {
        let err = anyhow::anyhow!("connection reset").context("fetching feed");
        let failure = ImportFailure::from_error(&err);

        assert_eq!(failure.stage, "process");
        assert_eq!(failure.message, "fetching feed: connection reset");
        assert!(failure.code.is_none());
    }

    #[test]
    fn structured_failure_survives_context() {
        let err: anyhow::Error = ImportFailure::new("upsert", "duplicate sku")
            .with_code("E_DUP")
            .with_external_id("SKU-42")
            .into();
        let err = err.context("batch 3");

        let failure = ImportFailure::from_error(&err);
        assert_eq!(failure.stage, "upsert");
        assert_eq!(failure.message, "duplicate sku");
        assert_eq!(failure.code.as_deref(), Some("E_DUP"));
        assert_eq!(failure.external_id.as_deref(), Some("SKU-42"));
    }

    #[test]
    fn result_context_keeps_failure_findable() {
        let result: Result<(), ImportFailure> = Err(ImportFailure::new("parse", "bad header"));
        let err = result.context("reading csv").unwrap_err();
        assert_eq!(ImportFailure::from_error(&err).stage, "parse");
    }
}
