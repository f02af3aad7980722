//! HTTP API application wiring (Axum router).
//!
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and query parsing
//! - `errors.rs`: consistent error responses

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use importq_infra::ImportQueue;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router around a queue handle.
///
/// The queue may or may not be started; the routes only read and enqueue.
pub fn build_app(queue: ImportQueue) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(queue)))
}
