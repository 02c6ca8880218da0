//! Authenticated HTTP fetch utilities + the warehouse load sink.

use std::time::Duration;

use anyhow::Context;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod bigquery;

pub use bigquery::{split_batches, BigQueryConfig, BigQueryLoader, LoadError, LoadRequest, TableRef, WarehouseSink};

/// Longest slice of an error body kept in `FetchError::HttpStatus`.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` keeps reqwest's default (no overall request timeout).
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin wrapper over `reqwest::Client` that checks status codes and decodes JSON.
///
/// Every call is a single attempt: non-success statuses come back as
/// `FetchError::HttpStatus` and are never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET `url` with bearer auth and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let request = self.client.get(url).bearer_auth(bearer_token).query(query);
        self.send_json(request).await
    }

    /// Send a prepared request, fail on non-success status, decode the JSON body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, FetchError> {
        let request = request.build()?;
        let span = info_span!("http_fetch", method = %request.method(), url = %request.url());

        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: truncate_body(&body),
                });
            }

            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
