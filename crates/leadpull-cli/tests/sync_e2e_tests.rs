//! End-to-end tests for `leadpull sync` against mocked Apify and BigQuery endpoints.

use assert_cmd::Command;
use predicates::prelude::*;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const ACTOR_RUNS_PATH: &str = "/v2/acts/snehdhruv~google-places-lead-scraper/runs";
const UPLOAD_PATH: &str = "/upload/bigquery/v2/projects/test-project/jobs";

fn runs_response() -> serde_json::Value {
    serde_json::json!({
        "data": {
            "total": 3,
            "items": [
                {"id": "run-1", "defaultDatasetId": "ds-1", "status": "SUCCEEDED", "startedAt": "2026-10-18T10:00:00.000Z"},
                {"id": "run-2", "defaultDatasetId": "ds-1", "status": "SUCCEEDED", "startedAt": "2026-10-18T11:00:00.000Z"},
                {"id": "run-3", "defaultDatasetId": "ds-3", "status": "FAILED", "startedAt": "2026-10-18T12:00:00.000Z"}
            ]
        }
    })
}

fn dataset_response() -> serde_json::Value {
    serde_json::json!([
        {"name": "Acme", "emailList": ["jane@acme.com", "noreply@acme.com"]},
        {"name": "Beta", "emailList": ["bob@beta.io"], "rating": 4.1}
    ])
}

async fn mount_apify(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(ACTOR_RUNS_PATH))
        .and(query_param("desc", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(runs_response()))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/datasets/ds-1/items"))
        .and(query_param("clean", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(dataset_response()))
        .expect(1)
        .mount(server)
        .await;
}

fn leadpull(server: &MockServer) -> Command {
    let mut cmd = Command::cargo_bin("leadpull").unwrap();
    cmd.env("APIFY_API_KEY", "apify-test-key")
        .env("APIFY_BASE_URL", server.uri())
        .env("BIGQUERY_BASE_URL", server.uri())
        .env("GOOGLE_OAUTH_ACCESS_TOKEN", "gcp-test-token")
        .env("PROJECT_ID", "test-project")
        .env("LOAD_POLL_INTERVAL_MS", "1")
        .env("RUST_LOG", "info")
        .env_remove("APIFY_ACTOR_ID")
        .env_remove("LOAD_BATCH_SIZE");
    cmd
}

#[tokio::test]
async fn test_sync_loads_filtered_rows() {
    let server = MockServer::start().await;
    mount_apify(&server).await;

    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .and(query_param("uploadType", "multipart"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jobReference": {"projectId": "test-project", "jobId": "job-1"},
            "status": {"state": "DONE"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    leadpull(&server)
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("rows=2"))
        .stdout(predicate::str::contains("duplicates=1"))
        .stdout(predicate::str::contains("loaded=2"))
        .stdout(predicate::str::contains("batches=1"));
}

#[tokio::test]
async fn test_failed_load_batch_exits_with_code_one() {
    let server = MockServer::start().await;
    mount_apify(&server).await;

    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jobReference": {"projectId": "test-project", "jobId": "job-1"},
            "status": {
                "state": "DONE",
                "errorResult": {"reason": "invalid", "message": "schema mismatch"}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    leadpull(&server)
        .arg("sync")
        .env("LOAD_BATCH_SIZE", "1")
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("sync complete").not())
        .stderr(predicate::str::contains("batch 1 of 2 failed"));
}

#[tokio::test]
async fn test_missing_api_key_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    leadpull(&server)
        .env_remove("APIFY_API_KEY")
        .arg("sync")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("APIFY_API_KEY"));
}

#[tokio::test]
async fn test_dry_run_never_touches_the_warehouse() {
    let server = MockServer::start().await;
    mount_apify(&server).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    leadpull(&server)
        .env_remove("GOOGLE_OAUTH_ACCESS_TOKEN")
        .args(["sync", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rows=2"))
        .stdout(predicate::str::contains("loaded=0"))
        .stdout(predicate::str::contains("(dry run)"));
}

#[tokio::test]
async fn test_runs_lists_successful_runs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ACTOR_RUNS_PATH))
        .and(query_param("limit", "50"))
        .and(query_param("desc", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(runs_response()))
        .mount(&server)
        .await;

    leadpull(&server)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("run-1\tds-1"))
        .stdout(predicate::str::contains("run-3").not());
}
