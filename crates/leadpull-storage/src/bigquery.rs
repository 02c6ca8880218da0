//! Append-only BigQuery load jobs fed from NDJSON batches.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use leadpull_core::LeadRow;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{FetchError, HttpFetcher};

pub const DEFAULT_BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const JOB_STATE_DONE: &str = "DONE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// One batch handed to a sink. `batch_no` is 1-based.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub run_id: Uuid,
    pub batch_no: usize,
    pub rows: &'a [LeadRow],
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("serializing batch rows: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("load job {job_id} failed ({reason}): {message}")]
    JobFailed {
        job_id: String,
        reason: String,
        message: String,
    },
    #[error("load job response carried no job reference")]
    MissingJobReference,
    #[error("load job {job_id} reported no status")]
    MissingJobStatus { job_id: String },
}

/// Append-only destination for normalized rows.
#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Append one batch and wait until the warehouse reports it committed.
    async fn append_batch(&self, table: &TableRef, request: LoadRequest<'_>) -> Result<(), LoadError>;
}

/// Fixed-size slices of `rows`, in order. A zero size is treated as one.
pub fn split_batches<T>(rows: &[T], batch_size: usize) -> std::slice::Chunks<'_, T> {
    rows.chunks(batch_size.max(1))
}

#[derive(Debug)]
pub struct BigQueryConfig {
    pub base_url: String,
    pub access_token: SecretString,
    pub poll_interval: Duration,
}

#[derive(Debug)]
pub struct BigQueryLoader {
    http: HttpFetcher,
    base_url: String,
    access_token: SecretString,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: Option<JobReference>,
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

impl BigQueryLoader {
    pub fn new(http: HttpFetcher, config: BigQueryConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
            poll_interval: config.poll_interval,
        }
    }

    /// Deterministic job id: same run, batch number and content map to the same id.
    pub fn job_id_for(run_id: Uuid, batch_no: usize, ndjson: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ndjson);
        let digest = hex::encode(hasher.finalize());
        format!("leadpull_{}_{}_{}", run_id.simple(), batch_no, &digest[..16])
    }

    pub fn to_ndjson(rows: &[LeadRow]) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut out, row)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    fn job_configuration(table: &TableRef, job_id: &str) -> serde_json::Value {
        json!({
            "jobReference": {
                "projectId": table.project_id,
                "jobId": job_id,
            },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": table.project_id,
                        "datasetId": table.dataset_id,
                        "tableId": table.table_id,
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_APPEND",
                    "autodetect": false,
                }
            }
        })
    }

    fn multipart_related_body(boundary: &str, metadata: &serde_json::Value, ndjson: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(ndjson.len() + 512);
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(metadata.to_string().as_bytes());
        body.extend_from_slice(
            format!("\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(ndjson);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    async fn insert_job(
        &self,
        table: &TableRef,
        job_id: &str,
        ndjson: Vec<u8>,
    ) -> Result<JobResource, LoadError> {
        let boundary = format!("leadpull-{}", Uuid::new_v4().simple());
        let metadata = Self::job_configuration(table, job_id);
        let body = Self::multipart_related_body(&boundary, &metadata, &ndjson);
        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs",
            self.base_url, table.project_id
        );

        let request = self
            .http
            .client()
            .post(url)
            .bearer_auth(self.access_token.expose_secret())
            .query(&[("uploadType", "multipart")])
            .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
            .body(body);
        Ok(self.http.send_json(request).await?)
    }

    async fn get_job(&self, project_id: &str, reference: &JobReference) -> Result<JobResource, LoadError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.base_url, project_id, reference.job_id
        );
        let mut query = Vec::new();
        if let Some(location) = &reference.location {
            query.push(("location", location.clone()));
        }
        Ok(self
            .http
            .get_json(&url, self.access_token.expose_secret(), &query)
            .await?)
    }

    fn check_finished(job_id: &str, status: &JobStatus) -> Result<(), LoadError> {
        match &status.error_result {
            Some(err) => Err(LoadError::JobFailed {
                job_id: job_id.to_string(),
                reason: err.reason.clone().unwrap_or_else(|| "unknown".to_string()),
                message: err.message.clone().unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WarehouseSink for BigQueryLoader {
    async fn append_batch(&self, table: &TableRef, request: LoadRequest<'_>) -> Result<(), LoadError> {
        let ndjson = Self::to_ndjson(request.rows)?;
        let job_id = Self::job_id_for(request.run_id, request.batch_no, &ndjson);
        info!(%table, %job_id, rows = request.rows.len(), "submitting load job");

        let mut job = self.insert_job(table, &job_id, ndjson).await?;
        let reference = job.job_reference.take().ok_or(LoadError::MissingJobReference)?;

        let mut status = job.status;
        loop {
            if let Some(status) = &status {
                if status.state == JOB_STATE_DONE {
                    return Self::check_finished(&reference.job_id, status);
                }
                debug!(job_id = %reference.job_id, state = %status.state, "load job pending");
            }
            tokio::time::sleep(self.poll_interval).await;
            status = self.get_job(&table.project_id, &reference).await?.status;
            if status.is_none() {
                return Err(LoadError::MissingJobStatus {
                    job_id: reference.job_id.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpClientConfig;
    use leadpull_core::{DEFAULT_COUNTRY, EMPTY_OPENING_HOURS, LEAD_SOURCE};
    use wiremock::matchers::{body_string_contains, header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn row(email: &str) -> LeadRow {
        LeadRow {
            email: email.to_string(),
            business_name: "Acme Plumbing".into(),
            phone: "+1 555 0100".into(),
            website: "https://acme.test".into(),
            address: "1 Main St".into(),
            city: String::new(),
            state: String::new(),
            postal_code: String::new(),
            country: DEFAULT_COUNTRY.into(),
            category: "plumber".into(),
            rating: 4.5,
            review_count: 12,
            place_id: "pid-1".into(),
            google_maps_url: String::new(),
            latitude: 40.0,
            longitude: -73.0,
            opening_hours: EMPTY_OPENING_HOURS.into(),
            source: LEAD_SOURCE.into(),
            scraped_at: "2026-10-19T08:15:00.000000Z".into(),
            job_id: "run-1".into(),
            batch_key: "2026-10-19_bulk_import".into(),
            raw_payload: "{}".into(),
        }
    }

    fn table() -> TableRef {
        TableRef {
            project_id: "proj".into(),
            dataset_id: "lead_pipeline".into(),
            table_id: "leads_scraped".into(),
        }
    }

    fn loader(base_url: String) -> BigQueryLoader {
        BigQueryLoader::new(
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            BigQueryConfig {
                base_url,
                access_token: SecretString::from("gcp-token".to_string()),
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn batches_are_fixed_size_and_ordered() {
        let rows: Vec<u32> = (0..2500).collect();
        let sizes: Vec<usize> = split_batches(&rows, 1000).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(split_batches(&rows, 1000).nth(2).unwrap()[0], 2000);
        assert_eq!(split_batches(&rows, 0).count(), 2500);
    }

    #[test]
    fn job_id_is_deterministic_and_valid() {
        let run_id = Uuid::new_v4();
        let a = BigQueryLoader::job_id_for(run_id, 1, b"{}\n");
        let b = BigQueryLoader::job_id_for(run_id, 1, b"{}\n");
        let c = BigQueryLoader::job_id_for(run_id, 2, b"{}\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'));
    }

    #[test]
    fn ndjson_has_one_line_per_row() {
        let bytes = BigQueryLoader::to_ndjson(&[row("a@acme.com"), row("b@acme.com")]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"email\":\"a@acme.com\""));
        assert!(lines[1].contains("\"apify_run_id\":\"run-1\""));
    }

    #[tokio::test]
    async fn append_batch_uploads_then_polls_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .and(query_param("uploadType", "multipart"))
            .and(header("authorization", "Bearer gcp-token"))
            .and(body_string_contains("\"writeDisposition\":\"WRITE_APPEND\""))
            .and(body_string_contains("\"tableId\":\"leads_scraped\""))
            .and(body_string_contains("jane@acme.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "proj", "jobId": "job-123", "location": "US"},
                "status": {"state": "RUNNING"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/job-123"))
            .and(query_param("location", "US"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "proj", "jobId": "job-123", "location": "US"},
                "status": {"state": "DONE"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let rows = vec![row("jane@acme.com")];
        loader(server.uri())
            .append_batch(
                &table(),
                LoadRequest {
                    run_id: Uuid::new_v4(),
                    batch_no: 1,
                    rows: &rows,
                },
            )
            .await
            .expect("load succeeds");
    }

    #[tokio::test]
    async fn job_without_status_fails_instead_of_polling_forever() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "proj", "jobId": "job-7"},
                "status": {"state": "RUNNING"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/job-7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "proj", "jobId": "job-7"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let rows = vec![row("jane@acme.com")];
        let err = loader(server.uri())
            .append_batch(
                &table(),
                LoadRequest {
                    run_id: Uuid::new_v4(),
                    batch_no: 1,
                    rows: &rows,
                },
            )
            .await
            .expect_err("missing status must fail");
        assert!(matches!(err, LoadError::MissingJobStatus { ref job_id } if job_id == "job-7"));
    }

    #[tokio::test]
    async fn error_result_fails_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "proj", "jobId": "job-9"},
                "status": {"state": "PENDING"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/bigquery/v2/projects/proj/jobs/job-9$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "proj", "jobId": "job-9"},
                "status": {
                    "state": "DONE",
                    "errorResult": {"reason": "invalid", "message": "No such field: foo"}
                }
            })))
            .mount(&server)
            .await;

        let rows = vec![row("jane@acme.com")];
        let err = loader(server.uri())
            .append_batch(
                &table(),
                LoadRequest {
                    run_id: Uuid::new_v4(),
                    batch_no: 3,
                    rows: &rows,
                },
            )
            .await
            .expect_err("load fails");
        match err {
            LoadError::JobFailed { job_id, reason, message } => {
                assert_eq!(job_id, "job-9");
                assert_eq!(reason, "invalid");
                assert!(message.contains("foo"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rejected_upload_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("access denied"))
            .mount(&server)
            .await;

        let rows = vec![row("jane@acme.com")];
        let err = loader(server.uri())
            .append_batch(
                &table(),
                LoadRequest {
                    run_id: Uuid::new_v4(),
                    batch_no: 1,
                    rows: &rows,
                },
            )
            .await
            .expect_err("403 fails");
        assert!(matches!(err, LoadError::Fetch(FetchError::HttpStatus { status: 403, .. })));
    }
}
