//! Dataset item -> warehouse row mapping.

use chrono::{DateTime, SecondsFormat, Utc};
use leadpull_core::{
    batch_key_for, DatasetItem, EmailFilter, LeadRow, DEFAULT_COUNTRY, EMPTY_OPENING_HOURS,
    LEAD_SOURCE,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Values stamped onto every row produced for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeContext {
    pub job_id: String,
    pub scraped_at: String,
    pub batch_key: String,
}

impl NormalizeContext {
    /// `batch_key` comes from the import run's start, not from `scraped_at`.
    pub fn new(job_id: impl Into<String>, scraped_at: DateTime<Utc>, run_started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            scraped_at: scraped_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            batch_key: batch_key_for(run_started_at),
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("item {index}: field `{field}` is not numeric: {value}")]
    InvalidNumber {
        index: usize,
        field: &'static str,
        value: String,
    },
}

/// Lowercased, trimmed text of one `emailList` entry, or `None` when blank.
///
/// Arrays and objects are never addresses; zero counts as an empty entry.
pub fn normalize_email(raw: &JsonValue) -> Option<String> {
    let text = match raw {
        JsonValue::Null | JsonValue::Bool(false) | JsonValue::Array(_) | JsonValue::Object(_) => {
            return None
        }
        JsonValue::Number(n) if n.as_f64() == Some(0.0) => return None,
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    let email = text.to_lowercase().trim().to_string();
    if email.is_empty() {
        None
    } else {
        Some(email)
    }
}

fn float_field(item: &DatasetItem, index: usize, key: &'static str) -> Result<f64, NormalizeError> {
    let invalid = |value: &JsonValue| NormalizeError::InvalidNumber {
        index,
        field: key,
        value: value.to_string(),
    };
    match item.get(key) {
        None => Ok(0.0),
        Some(value @ JsonValue::Number(n)) => n.as_f64().ok_or_else(|| invalid(value)),
        Some(value @ JsonValue::String(s)) => s.trim().parse().map_err(|_| invalid(value)),
        Some(value) => Err(invalid(value)),
    }
}

fn count_field(item: &DatasetItem, index: usize, key: &'static str) -> Result<i64, NormalizeError> {
    let invalid = |value: &JsonValue| NormalizeError::InvalidNumber {
        index,
        field: key,
        value: value.to_string(),
    };
    match item.get(key) {
        None => Ok(0),
        Some(value @ JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .ok_or_else(|| invalid(value)),
        Some(value @ JsonValue::String(s)) => s.trim().parse().map_err(|_| invalid(value)),
        Some(value) => Err(invalid(value)),
    }
}

/// Map items to rows: one row per accepted email, in input order.
///
/// Items without an email list produce nothing. Numeric fields are only
/// read for items that produce at least one row, so a malformed rating on
/// an item with no usable email is never reported.
pub fn normalize_items(
    items: &[DatasetItem],
    ctx: &NormalizeContext,
    filter: &EmailFilter,
) -> Result<Vec<LeadRow>, NormalizeError> {
    let mut rows = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let emails: Vec<String> = item
            .email_list()
            .iter()
            .filter_map(normalize_email)
            .filter(|email| filter.accepts(email))
            .collect();
        if emails.is_empty() {
            continue;
        }

        let rating = float_field(item, index, "rating")?;
        let review_count = count_field(item, index, "userRatingsTotal")?;
        let latitude = float_field(item, index, "lat")?;
        let longitude = float_field(item, index, "lng")?;
        let raw_payload = item.to_json_string();

        for email in emails {
            rows.push(LeadRow {
                email,
                business_name: item.text("name"),
                phone: item.text("phone"),
                website: item.text("website"),
                address: item.text("formattedAddress"),
                city: String::new(),
                state: String::new(),
                postal_code: String::new(),
                country: DEFAULT_COUNTRY.to_string(),
                category: item.text("searchTerm"),
                rating,
                review_count,
                place_id: item.text("placeId"),
                google_maps_url: item.text("googleMapsUrl"),
                latitude,
                longitude,
                opening_hours: EMPTY_OPENING_HOURS.to_string(),
                source: LEAD_SOURCE.to_string(),
                scraped_at: ctx.scraped_at.clone(),
                job_id: ctx.job_id.clone(),
                batch_key: ctx.batch_key.clone(),
                raw_payload: raw_payload.clone(),
            });
        }
    }

    Ok(rows)
}
