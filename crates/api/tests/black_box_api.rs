use std::time::Duration;

use importq_infra::{ImportQueue, InMemoryJobStore, JobContext, QueueConfig};
use reqwest::StatusCode;
use serde_json::json;
use uuid::Uuid;

struct TestServer {
    base_url: String,
    queue: ImportQueue,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let queue = ImportQueue::new(
            InMemoryJobStore::arc(),
            QueueConfig::default().with_poll_interval(Duration::from_millis(10)),
        );

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = importq_api::app::build_app(queue.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            queue,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.queue.stop();
        self.handle.abort();
    }
}

async fn enqueue(client: &reqwest::Client, base_url: &str, import_type: &str) -> serde_json::Value {
    let res = client
        .post(format!("{}/jobs", base_url))
        .json(&json!({
            "source_id": Uuid::now_v7(),
            "import_type": import_type,
            "created_by": Uuid::now_v7(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn get_job_in_status(
    client: &reqwest::Client,
    base_url: &str,
    id: &str,
    status: &str,
) -> serde_json::Value {
    // The queue settles jobs in the background; poll briefly.
    for _ in 0..200 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let job: serde_json::Value = res.json().await.unwrap();
        if job["status"] == status {
            return job;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not reach {status} within timeout");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn enqueued_job_is_visible_and_queued() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created = enqueue(&client, &srv.base_url, "full").await;
    assert_eq!(created["status"], "queued");
    assert_eq!(created["import_type"], "full");
    assert_eq!(created["error_count"], 0);
    let id = created["id"].as_str().unwrap().to_string();

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let job: serde_json::Value = res.json().await.unwrap();
    assert_eq!(job["id"], created["id"]);
    assert!(job["finished_at"].is_null());

    let res = client
        .get(format!("{}/jobs?status=queued", srv.base_url))
        .send()
        .await
        .unwrap();
    let jobs: Vec<serde_json::Value> = res.json().await.unwrap();
    assert_eq!(jobs.len(), 1);

    let stats: serde_json::Value = client
        .get(format!("{}/jobs/stats", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queued"], 1);
    assert_eq!(stats["total"], 1);
}

#[tokio::test]
async fn processed_job_exposes_logs_and_errors() {
    let srv = TestServer::spawn().await;
    srv.queue.register_processor(|ctx: JobContext| async move {
        if ctx.attempt() == 1 {
            anyhow::bail!("feed timed out");
        }
        ctx.update_progress(12, 12).await?;
        anyhow::Ok(())
    });
    srv.queue.start();

    let client = reqwest::Client::new();
    let created = enqueue(&client, &srv.base_url, "delta").await;
    let id = created["id"].as_str().unwrap().to_string();

    let job = get_job_in_status(&client, &srv.base_url, &id, "success").await;
    assert_eq!(job["error_count"], 1);
    assert_eq!(job["processed_items"], 12);

    let errors: Vec<serde_json::Value> = client
        .get(format!("{}/jobs/{}/errors", srv.base_url, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["stage"], "process");
    assert_eq!(errors[0]["message"], "feed timed out");

    let logs: Vec<serde_json::Value> = client
        .get(format!("{}/jobs/{}/logs", srv.base_url, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs.iter().any(|l| l["message"] == "Import completed" && l["level"] == "info"));

    let queue: serde_json::Value = client
        .get(format!("{}/queue", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queue["running"], true);
    assert_eq!(queue["concurrent_jobs"], 2);
}

#[tokio::test]
async fn unknown_job_is_404_with_json_error() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let missing = Uuid::now_v7();

    for path in ["", "/logs", "/errors"] {
        let res = client
            .get(format!("{}/jobs/{}{}", srv.base_url, missing, path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND, "path {path:?}");
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["error"], "not_found");
    }
}

#[tokio::test]
async fn malformed_ids_and_filters_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/jobs/not-a-uuid", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let res = client
        .get(format!("{}/jobs?status=done", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_status");
}
