use axum::http::StatusCode;
use serde::Deserialize;

use importq_core::{ImportType, JobId, JobStatus, SourceId, UserId};

use crate::app::errors;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub source_id: SourceId,
    pub import_type: ImportType,
    pub created_by: UserId,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn status(&self) -> Result<Option<JobStatus>, axum::response::Response> {
        match self.status.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    "status must be one of: queued, running, success, failed",
                )
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}
