//! Actor run source contract + the Apify implementation.

use async_trait::async_trait;
use leadpull_core::{ActorRun, DatasetItem};
use leadpull_storage::{FetchError, HttpFetcher};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub mod normalize;

pub use normalize::{normalize_email, normalize_items, NormalizeContext, NormalizeError};

pub const DEFAULT_APIFY_BASE_URL: &str = "https://api.apify.com";
pub const DEFAULT_ACTOR_ID: &str = "snehdhruv~google-places-lead-scraper";
pub const DEFAULT_RUN_LIMIT: usize = 50;
pub const DEFAULT_DATASET_ITEM_LIMIT: usize = 10_000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Where completed scrape runs and their datasets come from.
#[async_trait]
pub trait RunSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Most recent runs, filtered to the ones that finished successfully.
    async fn list_successful_runs(&self) -> Result<Vec<ActorRun>, SourceError>;

    async fn fetch_dataset_items(&self, dataset_id: &str) -> Result<Vec<DatasetItem>, SourceError>;
}

#[derive(Debug)]
pub struct ApifyConfig {
    pub base_url: String,
    pub actor_id: String,
    pub api_key: SecretString,
    pub run_limit: usize,
    pub dataset_item_limit: usize,
}

#[derive(Debug, Deserialize)]
struct RunListEnvelope {
    data: RunListPage,
}

#[derive(Debug, Deserialize)]
struct RunListPage {
    #[serde(default)]
    items: Vec<ActorRun>,
}

#[derive(Debug)]
pub struct ApifyActorSource {
    http: HttpFetcher,
    config: ApifyConfig,
}

impl ApifyActorSource {
    pub fn new(http: HttpFetcher, mut config: ApifyConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self { http, config }
    }

    pub fn runs_url(&self) -> String {
        format!("{}/v2/acts/{}/runs", self.config.base_url, self.config.actor_id)
    }

    pub fn dataset_items_url(&self, dataset_id: &str) -> String {
        format!("{}/v2/datasets/{}/items", self.config.base_url, dataset_id)
    }
}

#[async_trait]
impl RunSource for ApifyActorSource {
    fn source_id(&self) -> &str {
        &self.config.actor_id
    }

    async fn list_successful_runs(&self) -> Result<Vec<ActorRun>, SourceError> {
        let envelope: RunListEnvelope = self
            .http
            .get_json(
                &self.runs_url(),
                self.config.api_key.expose_secret(),
                &[
                    ("limit", self.config.run_limit.to_string()),
                    ("desc", "1".to_string()),
                ],
            )
            .await?;

        let listed = envelope.data.items.len();
        let runs: Vec<ActorRun> = envelope
            .data
            .items
            .into_iter()
            .filter(ActorRun::succeeded)
            .collect();
        info!(listed, successful = runs.len(), "found successful runs");
        Ok(runs)
    }

    async fn fetch_dataset_items(&self, dataset_id: &str) -> Result<Vec<DatasetItem>, SourceError> {
        let items: Vec<DatasetItem> = self
            .http
            .get_json(
                &self.dataset_items_url(dataset_id),
                self.config.api_key.expose_secret(),
                &[
                    ("clean", "true".to_string()),
                    ("limit", self.config.dataset_item_limit.to_string()),
                ],
            )
            .await?;
        Ok(items)
    }
}
