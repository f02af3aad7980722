//! Closed vocabularies: job status, import type, log level.
//!
//! Each type has a stable lowercase string form used both on the wire (serde)
//! and in the persisted tables.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Job execution status.
///
/// Transitions only along `queued → running → {success | failed | queued}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by exactly one worker
    Running,
    /// Completed successfully
    Success,
    /// Cancelled or out of retries
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Whether `self → next` is an edge of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Queued)
        )
    }
}

/// Kind of import a job performs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportType {
    /// Full catalog ingestion
    Full,
    /// Incremental changes since the last import
    Delta,
}

impl ImportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportType::Full => "full",
            ImportType::Delta => "delta",
        }
    }
}

/// Severity of a job log entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

macro_rules! impl_str_enum {
    ($t:ty, $kind:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == normalized)
                    .ok_or_else(|| DomainError::unknown_variant($kind, s))
            }
        }
    };
}

impl_str_enum!(
    JobStatus,
    "job status",
    [JobStatus::Queued, JobStatus::Running, JobStatus::Success, JobStatus::Failed]
);
impl_str_enum!(ImportType, "import type", [ImportType::Full, ImportType::Delta]);
impl_str_enum!(LogLevel, "log level", [LogLevel::Info, LogLevel::Warn, LogLevel::Error]);
