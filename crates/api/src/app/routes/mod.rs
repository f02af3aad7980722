use axum::{routing::get, Router};

pub mod jobs;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/queue", get(system::queue_status))
        .nest("/jobs", jobs::router())
}
