mod common;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use bullseye::JobStatus;
use bullseye::config::DEFAULT_MODEL;

use common::*;

const REPO: &str = "https://example.com/acme/shop.git";

async fn spawn_server(h: &Harness) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let orchestrator = h.orchestrator.clone();
    tokio::spawn(async move { bullseye::api::serve(listener, orchestrator, std::future::pending()).await });
    format!("http://{addr}")
}

fn job_id(body: &Value) -> uuid::Uuid {
    body["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn job_lifecycle_over_http() {
    let h = harness(
        registry(vec![Arc::new(SharedRuleScanner("alpha"))]),
        RecordingProvider::new(Duration::ZERO),
    )
    .await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let health: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");

    let resp = client
        .post(format!("{base}/api/jobs"))
        .json(&json!({ "repo_url": REPO }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["status"], "pending");
    let id = job_id(&created);

    let done = h.orchestrator.wait(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error_message);

    let job: Value = client.get(format!("{base}/api/jobs/{id}")).send().await.unwrap().json().await.unwrap();
    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress"], 100);

    let high: Value = client
        .get(format!("{base}/api/jobs/{id}/findings?severity=HIGH"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(high["count"], 4);

    let llm: Value = client
        .get(format!("{base}/api/jobs/{id}/findings?scanner=llm"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(llm["count"], 2);

    let summary: Value = client
        .get(format!("{base}/api/jobs/{id}/findings/summary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["total"], 4);

    let log: Value = client
        .get(format!("{base}/api/jobs/{id}/status?limit=5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let updates = log["updates"].as_array().unwrap();
    assert_eq!(updates.len(), 5);
    assert_eq!(updates[0]["status"], "pending");

    let components: Value = client
        .get(format!("{base}/api/jobs/{id}/components"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(components.as_array().unwrap().len(), 2);

    let scanners: Value = client
        .get(format!("{base}/api/jobs/{id}/scanners"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(scanners.as_array().unwrap().len(), 2);

    let resp = client.get(format!("{base}/api/jobs/{id}/report")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["executive_summary"], EXECUTIVE_REPLY);

    let stream = client
        .get(format!("{base}/api/jobs/{id}/stream"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(stream.contains("event: complete"), "{stream}");
    assert!(stream.contains("\"status\":\"completed\""), "{stream}");

    let list: Value = client.get(format!("{base}/api/jobs")).send().await.unwrap().json().await.unwrap();
    assert_eq!(list["count"], 1);

    let resp = client.delete(format!("{base}/api/jobs/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = client.get(format!("{base}/api/jobs/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["status"], 404);
    assert!(body["error"]["message"].as_str().unwrap().ends_with("not found"));
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let h = harness(registry(vec![]), RecordingProvider::new(Duration::ZERO)).await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/jobs"))
        .json(&json!({ "repo_url": "not a url" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["status"], 400);

    let resp = client
        .post(format!("{base}/api/jobs"))
        .json(&json!({ "repo_url": REPO, "model": "not-permitted" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .get(format!("{base}/api/jobs?status=bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let missing = uuid::Uuid::new_v4();
    let resp = client
        .post(format!("{base}/api/jobs/{missing}/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn running_jobs_cannot_be_deleted() {
    let (provider, mut file_calls) = RecordingProvider::hanging_on_files();
    let h = harness(registry(vec![]), provider).await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/api/jobs"))
        .json(&json!({ "repo_url": REPO }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = job_id(&created);
    tokio::time::timeout(Duration::from_secs(10), file_calls.recv())
        .await
        .expect("analysis never started");

    let resp = client.delete(format!("{base}/api/jobs/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = client.post(format!("{base}/api/jobs/{id}/stop")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let done = h.orchestrator.wait(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);

    let resp = client.delete(format!("{base}/api/jobs/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn api_key_guards_the_api_but_not_health() {
    let h = harness_with(registry(vec![]), RecordingProvider::new(Duration::ZERO), |s| {
        s.api.api_key = Some("letmein".into());
    })
    .await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client.get(format!("{base}/api/stats")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("{base}/api/stats"))
        .header("x-api-key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("{base}/api/stats"))
        .header("x-api-key", "letmein")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client
        .get(format!("{base}/api/models"))
        .bearer_auth("letmein")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let models: Value = resp.json().await.unwrap();
    assert_eq!(models["default"], DEFAULT_MODEL);
    assert!(models["models"].as_array().unwrap().iter().any(|m| m == DEFAULT_MODEL));
}
