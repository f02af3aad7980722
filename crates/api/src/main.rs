use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use importq_infra::{ImportQueue, InMemoryJobStore, JobStore, PostgresJobStore, QueueConfig};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const MAX_DB_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    importq_observability::init();

    let config = QueueConfig::from_env().context("invalid queue configuration")?;

    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PostgresJobStore::connect(&url, MAX_DB_CONNECTIONS)
                .await
                .context("failed to connect to DATABASE_URL")?;
            store.ensure_schema().await.context("failed to apply schema")?;
            Arc::new(store)
        }
        Err(_) => {
            warn!("DATABASE_URL not set; using in-memory job store (state is lost on exit)");
            InMemoryJobStore::arc()
        }
    };

    let queue = ImportQueue::new(store, config);
    let app = importq_api::app::build_app(queue.clone());

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.stop();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
