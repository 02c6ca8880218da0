use std::time::Duration;

use leadpull_adapters::{
    DEFAULT_ACTOR_ID, DEFAULT_APIFY_BASE_URL, DEFAULT_DATASET_ITEM_LIMIT, DEFAULT_RUN_LIMIT,
};
use leadpull_storage::bigquery::{DEFAULT_BIGQUERY_BASE_URL, DEFAULT_POLL_INTERVAL};
use leadpull_storage::TableRef;
use secrecy::SecretString;

use crate::SyncError;

pub const DEFAULT_PROJECT_ID: &str = "trillboard-new";
pub const DEFAULT_DATASET_ID: &str = "lead_pipeline";
pub const DEFAULT_TABLE_ID: &str = "leads_scraped";
pub const DEFAULT_LOAD_BATCH_SIZE: usize = 1000;

/// Process configuration, read from the environment.
#[derive(Debug)]
pub struct SyncConfig {
    pub apify_api_key: SecretString,
    pub apify_base_url: String,
    pub actor_id: String,
    pub run_limit: usize,
    pub dataset_item_limit: usize,
    pub table: TableRef,
    pub bigquery_base_url: String,
    pub bigquery_access_token: Option<SecretString>,
    pub load_batch_size: usize,
    pub load_poll_interval: Duration,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `APIFY_API_KEY` is the only required key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or_default = |key: &str, default: &str| non_blank(key).unwrap_or_else(|| default.to_string());
        let positive = |key: &str, default: usize| {
            non_blank(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        let apify_api_key = non_blank("APIFY_API_KEY").ok_or_else(|| {
            SyncError::Config(
                "APIFY_API_KEY environment variable is required; set it in the environment or a .env file"
                    .to_string(),
            )
        })?;

        Ok(Self {
            apify_api_key: SecretString::from(apify_api_key),
            apify_base_url: or_default("APIFY_BASE_URL", DEFAULT_APIFY_BASE_URL),
            actor_id: or_default("APIFY_ACTOR_ID", DEFAULT_ACTOR_ID),
            run_limit: positive("APIFY_RUN_LIMIT", DEFAULT_RUN_LIMIT),
            dataset_item_limit: positive("APIFY_DATASET_ITEM_LIMIT", DEFAULT_DATASET_ITEM_LIMIT),
            table: TableRef {
                project_id: or_default("PROJECT_ID", DEFAULT_PROJECT_ID),
                dataset_id: or_default("DATASET_ID", DEFAULT_DATASET_ID),
                table_id: or_default("TABLE_ID", DEFAULT_TABLE_ID),
            },
            bigquery_base_url: or_default("BIGQUERY_BASE_URL", DEFAULT_BIGQUERY_BASE_URL),
            bigquery_access_token: non_blank("GOOGLE_OAUTH_ACCESS_TOKEN").map(SecretString::from),
            load_batch_size: positive("LOAD_BATCH_SIZE", DEFAULT_LOAD_BATCH_SIZE),
            load_poll_interval: non_blank("LOAD_POLL_INTERVAL_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            http_timeout_secs: non_blank("LEADPULL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok()),
            user_agent: or_default(
                "LEADPULL_USER_AGENT",
                concat!("leadpull/", env!("CARGO_PKG_VERSION")),
            ),
        })
    }
}
