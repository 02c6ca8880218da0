//! Import run orchestration: list runs, fetch datasets, normalize, load.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use leadpull_adapters::{
    normalize_items, ApifyActorSource, ApifyConfig, NormalizeContext, RunSource, SourceError,
};
use leadpull_core::{ActorRun, EmailFilter, LeadRow};
use leadpull_storage::{
    split_batches, BigQueryConfig, BigQueryLoader, HttpClientConfig, HttpFetcher, LoadError,
    LoadRequest, TableRef, WarehouseSink,
};
use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;

pub use config::{
    SyncConfig, DEFAULT_DATASET_ID, DEFAULT_LOAD_BATCH_SIZE, DEFAULT_PROJECT_ID, DEFAULT_TABLE_ID,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("listing runs: {0}")]
    ListRuns(#[source] SourceError),
    #[error("batch {batch_no} of {batch_count} failed: {source}")]
    BatchLoad {
        batch_no: usize,
        batch_count: usize,
        #[source]
        source: LoadError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub successful_runs: usize,
    pub processed_datasets: usize,
    pub skipped_duplicates: usize,
    pub failed_jobs: usize,
    pub fetched_items: usize,
    pub normalized_rows: usize,
    pub loaded_batches: usize,
    pub loaded_rows: usize,
    pub dry_run: bool,
    pub output_path: Option<String>,
}

struct JobRows {
    fetched_items: usize,
    rows: Vec<LeadRow>,
}

pub struct SyncPipeline {
    source: Box<dyn RunSource>,
    sink: Option<Box<dyn WarehouseSink>>,
    table: TableRef,
    batch_size: usize,
    filter: EmailFilter,
    output: Option<PathBuf>,
}

impl SyncPipeline {
    /// A pipeline without a sink runs in dry-run mode and never loads.
    pub fn new(
        source: Box<dyn RunSource>,
        sink: Option<Box<dyn WarehouseSink>>,
        table: TableRef,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            sink,
            table,
            batch_size: batch_size.max(1),
            filter: EmailFilter::default(),
            output: None,
        }
    }

    /// Wire the Apify source and, unless `dry_run`, the BigQuery loader.
    pub fn from_config(config: SyncConfig, dry_run: bool) -> Result<Self, SyncError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;

        let sink: Option<Box<dyn WarehouseSink>> = if dry_run {
            None
        } else {
            let access_token: SecretString = config.bigquery_access_token.ok_or_else(|| {
                SyncError::Config(
                    "GOOGLE_OAUTH_ACCESS_TOKEN is required to load into BigQuery (use --dry-run to skip loading)"
                        .to_string(),
                )
            })?;
            Some(Box::new(BigQueryLoader::new(
                http.clone(),
                BigQueryConfig {
                    base_url: config.bigquery_base_url,
                    access_token,
                    poll_interval: config.load_poll_interval,
                },
            )))
        };

        let source = ApifyActorSource::new(
            http,
            ApifyConfig {
                base_url: config.apify_base_url,
                actor_id: config.actor_id,
                api_key: config.apify_api_key,
                run_limit: config.run_limit,
                dataset_item_limit: config.dataset_item_limit,
            },
        );

        Ok(Self::new(
            Box::new(source),
            sink,
            config.table,
            config.load_batch_size,
        ))
    }

    pub fn with_email_filter(mut self, filter: EmailFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Write the normalized rows as NDJSON to `path` (dry-run only).
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.sink.is_none()
    }

    pub async fn list_runs(&self) -> Result<Vec<ActorRun>, SyncError> {
        self.source
            .list_successful_runs()
            .await
            .map_err(SyncError::ListRuns)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.run_inner(run_id, started_at).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        info!(dry_run = self.is_dry_run(), table = %self.table, "starting bulk import");

        let runs = self.list_runs().await?;

        let mut all_rows: Vec<LeadRow> = Vec::new();
        let mut processed_datasets: HashSet<String> = HashSet::new();
        let mut skipped_duplicates = 0usize;
        let mut failed_jobs = 0usize;
        let mut fetched_items = 0usize;

        for run in &runs {
            let dataset_id = run.default_dataset_id.as_str();
            if processed_datasets.contains(dataset_id) {
                info!(dataset_id, job_id = %run.id, "skipping already processed dataset");
                skipped_duplicates += 1;
                continue;
            }

            info!(dataset_id, job_id = %run.id, job_started_at = %run.started_at, "processing dataset");
            match self.collect_job_rows(run, started_at).await {
                Ok(job) => {
                    info!(dataset_id, items = job.fetched_items, rows = job.rows.len(), "normalized email records");
                    fetched_items += job.fetched_items;
                    all_rows.extend(job.rows);
                    processed_datasets.insert(dataset_id.to_string());
                }
                Err(err) => {
                    warn!(dataset_id, job_id = %run.id, error = %format!("{err:#}"), "error processing dataset; skipping");
                    failed_jobs += 1;
                }
            }
        }

        info!(total = all_rows.len(), "total email records to insert");

        let mut loaded_batches = 0usize;
        let mut loaded_rows = 0usize;
        let mut output_path = None;

        match self.sink.as_deref() {
            None => {
                if let Some(path) = &self.output {
                    write_ndjson(path, &all_rows).await?;
                    info!(path = %path.display(), rows = all_rows.len(), "dry run: wrote rows");
                    output_path = Some(path.display().to_string());
                } else {
                    info!(rows = all_rows.len(), "dry run: skipping load");
                }
            }
            Some(_) if all_rows.is_empty() => info!("no data to insert"),
            Some(sink) => {
                let batch_count = all_rows.len().div_ceil(self.batch_size);
                for (index, batch) in split_batches(&all_rows, self.batch_size).enumerate() {
                    let batch_no = index + 1;
                    info!(batch_no, batch_count, rows = batch.len(), "inserting batch");
                    let request = LoadRequest {
                        run_id,
                        batch_no,
                        rows: batch,
                    };
                    if let Err(source) = sink.append_batch(&self.table, request).await {
                        error!(batch_no, error = %source, "failed to insert batch");
                        return Err(SyncError::BatchLoad {
                            batch_no,
                            batch_count,
                            source,
                        });
                    }
                    loaded_batches += 1;
                    loaded_rows += batch.len();
                    info!(batch_no, rows = batch.len(), "inserted records");
                }
            }
        }

        info!("bulk import completed successfully");

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            successful_runs: runs.len(),
            processed_datasets: processed_datasets.len(),
            skipped_duplicates,
            failed_jobs,
            fetched_items,
            normalized_rows: all_rows.len(),
            loaded_batches,
            loaded_rows,
            dry_run: self.is_dry_run(),
            output_path,
        })
    }

    async fn collect_job_rows(&self, run: &ActorRun, run_started_at: DateTime<Utc>) -> anyhow::Result<JobRows> {
        let items = self
            .source
            .fetch_dataset_items(&run.default_dataset_id)
            .await
            .with_context(|| format!("fetching dataset {}", run.default_dataset_id))?;
        info!(dataset_id = %run.default_dataset_id, items = items.len(), "fetched items");

        let ctx = NormalizeContext::new(run.id.clone(), Utc::now(), run_started_at);
        let rows = normalize_items(&items, &ctx, &self.filter)
            .with_context(|| format!("normalizing dataset {}", run.default_dataset_id))?;

        Ok(JobRows {
            fetched_items: items.len(),
            rows,
        })
    }
}

async fn write_ndjson(path: &Path, rows: &[LeadRow]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = BigQueryLoader::to_ndjson(rows).context("serializing rows")?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

pub async fn run_sync_once_from_env(dry_run: bool, output: Option<PathBuf>) -> Result<SyncRunSummary, SyncError> {
    let config = SyncConfig::from_env()?;
    let mut pipeline = SyncPipeline::from_config(config, dry_run)?;
    if let Some(path) = output {
        pipeline = pipeline.with_output(path);
    }
    pipeline.run_once().await
}

pub async fn list_runs_from_env() -> Result<Vec<ActorRun>, SyncError> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::from_config(config, true)?.list_runs().await
}
