//! Core domain model for the Apify lead import.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Value written to `LeadRow::source` for every row.
pub const LEAD_SOURCE: &str = "apify/google-maps";
pub const DEFAULT_COUNTRY: &str = "USA";
pub const EMPTY_OPENING_HOURS: &str = "{}";
pub const BATCH_KEY_SUFFIX: &str = "_bulk_import";

/// Local parts that denote automated or non-human mailboxes.
pub const ROLE_ACCOUNT_PREFIXES: &[&str] = &[
    "noreply",
    "no-reply",
    "postmaster",
    "abuse",
    "mailer-daemon",
    "bounce",
    "webmaster",
    "root",
    "sysadmin",
    "system",
];

/// Substrings that mark an address as a placeholder. Matched anywhere in the address.
pub const PLACEHOLDER_DOMAINS: &[&str] = &["example.com", "test.com", "domain.com"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "TIMING-OUT")]
    TimingOut,
    #[serde(rename = "TIMED-OUT")]
    TimedOut,
    #[serde(rename = "ABORTING")]
    Aborting,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(other)]
    Unknown,
}

/// One execution of the scraping actor, as returned by the run listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorRun {
    pub id: String,
    pub default_dataset_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

impl ActorRun {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Opaque dataset record. Kept as raw JSON so the full payload can be archived.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetItem {
    pub fields: Map<String, JsonValue>,
}

impl DatasetItem {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    /// Text value for `key`; missing or null becomes an empty string.
    pub fn text(&self, key: &str) -> String {
        match self.get(key) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Entries of `emailList`, or an empty slice when absent, null or not a list.
    pub fn email_list(&self) -> &[JsonValue] {
        match self.get("emailList") {
            Some(JsonValue::Array(entries)) => entries,
            _ => &[],
        }
    }

    pub fn to_json_string(&self) -> String {
        JsonValue::Object(self.fields.clone()).to_string()
    }
}

/// Warehouse row. One per (item, accepted email) pair.
///
/// `job_id`, `batch_key` and `raw_payload` serialize under the column names
/// the target table already uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRow {
    pub email: String,
    pub business_name: String,
    pub phone: String,
    pub website: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub category: String,
    pub rating: f64,
    pub review_count: i64,
    pub place_id: String,
    pub google_maps_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub opening_hours: String,
    pub source: String,
    pub scraped_at: String,
    #[serde(rename = "apify_run_id")]
    pub job_id: String,
    #[serde(rename = "list_key")]
    pub batch_key: String,
    #[serde(rename = "raw_data")]
    pub raw_payload: String,
}

/// Batch key shared by every row of one import run.
pub fn batch_key_for(run_started_at: DateTime<Utc>) -> String {
    format!("{}{}", run_started_at.format("%Y-%m-%d"), BATCH_KEY_SUFFIX)
}

/// Immutable role-account and placeholder lists applied to normalized emails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailFilter {
    role_prefixes: Vec<String>,
    placeholder_domains: Vec<String>,
}

impl Default for EmailFilter {
    fn default() -> Self {
        Self::new(ROLE_ACCOUNT_PREFIXES, PLACEHOLDER_DOMAINS)
    }
}

impl EmailFilter {
    pub fn new<S: AsRef<str>>(role_prefixes: &[S], placeholder_domains: &[S]) -> Self {
        Self {
            role_prefixes: role_prefixes
                .iter()
                .map(|p| p.as_ref().to_ascii_lowercase())
                .collect(),
            placeholder_domains: placeholder_domains
                .iter()
                .map(|d| d.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// True when the text before the first `@` is one of the role prefixes.
    pub fn is_role_account(&self, email: &str) -> bool {
        let Some((local, _)) = email.split_once('@') else {
            return false;
        };
        self.role_prefixes
            .iter()
            .any(|prefix| local.eq_ignore_ascii_case(prefix))
    }

    pub fn has_placeholder_domain(&self, email: &str) -> bool {
        let lower = email.to_ascii_lowercase();
        self.placeholder_domains
            .iter()
            .any(|domain| lower.contains(domain.as_str()))
    }

    pub fn accepts(&self, email: &str) -> bool {
        !email.is_empty() && !self.is_role_account(email) && !self.has_placeholder_domain(email)
    }
}
