use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use importq_infra::ImportQueue;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Local view of this instance: what it is running right now and its limits.
pub async fn queue_status(Extension(queue): Extension<ImportQueue>) -> impl IntoResponse {
    let config = queue.config();
    Json(serde_json::json!({
        "name": config.name,
        "running": queue.is_running(),
        "active_jobs": queue.active_jobs().iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        "concurrent_jobs": config.concurrent_jobs,
        "poll_interval_ms": config.poll_interval.as_millis() as u64,
        "max_retries": config.max_retries,
    }))
}
