use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use importq_core::JobId;
use importq_infra::ImportQueue;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(enqueue_job))
        .route("/stats", get(job_stats))
        .route("/:job_id", get(get_job))
        .route("/:job_id/logs", get(get_job_logs))
        .route("/:job_id/errors", get(get_job_errors))
}

pub async fn enqueue_job(
    Extension(queue): Extension<ImportQueue>,
    Json(body): Json<dto::EnqueueJobRequest>,
) -> axum::response::Response {
    match queue
        .enqueue_job(body.source_id, body.import_type, body.created_by)
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(queue): Extension<ImportQueue>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status() {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    match queue.list_jobs(status, query.limit()).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn job_stats(Extension(queue): Extension<ImportQueue>) -> axum::response::Response {
    match queue.job_stats().await {
        Ok(stats) => Json(serde_json::json!({
            "queued": stats.queued,
            "running": stats.running,
            "success": stats.success,
            "failed": stats.failed,
            "total": stats.total(),
        }))
        .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(queue): Extension<ImportQueue>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match queue.get_job_status(job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::not_found(job_id),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job_logs(
    Extension(queue): Extension<ImportQueue>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match known_job(&queue, &job_id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match queue.get_job_logs(job_id).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job_errors(
    Extension(queue): Extension<ImportQueue>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match known_job(&queue, &job_id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match queue.get_job_errors(job_id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// Parse the path id and make sure the job exists, so history endpoints
/// return 404 rather than an empty list for unknown ids.
async fn known_job(queue: &ImportQueue, raw: &str) -> Result<JobId, axum::response::Response> {
    let job_id = dto::parse_job_id(raw)?;
    match queue.get_job_status(job_id).await {
        Ok(Some(_)) => Ok(job_id),
        Ok(None) => Err(errors::not_found(job_id)),
        Err(e) => Err(errors::queue_error_to_response(e)),
    }
}
