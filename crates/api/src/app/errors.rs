use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use importq_infra::{QueueError, StoreError};

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotFound(id) | QueueError::Store(StoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}"))
        }
        QueueError::Store(StoreError::AlreadyExists(id)) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("job already exists: {id}"))
        }
        QueueError::StaleAttempt { .. } => {
            json_error(StatusCode::CONFLICT, "stale_attempt", err.to_string())
        }
        QueueError::Store(e @ StoreError::OutOfRange { .. }) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "out_of_range", e.to_string())
        }
        QueueError::Store(e @ StoreError::Decode(_)) | QueueError::Store(e @ StoreError::Storage(_)) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn not_found(id: impl std::fmt::Display) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}"))
}
