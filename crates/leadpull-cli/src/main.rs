use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use leadpull_sync::{list_runs_from_env, run_sync_once_from_env, SyncError};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadpull")]
#[command(about = "Import Apify Google Places lead runs into BigQuery")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch successful runs, normalize their datasets and append them to the warehouse.
    Sync {
        /// Fetch and normalize only; never load.
        #[arg(long)]
        dry_run: bool,
        /// With --dry-run, write the normalized rows as NDJSON to this path.
        #[arg(long, requires = "dry_run")]
        output: Option<PathBuf>,
    },
    /// List the successful runs that a sync would process.
    Runs,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

async fn run(cli: Cli) -> Result<(), SyncError> {
    match cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        output: None,
    }) {
        Commands::Sync { dry_run, output } => {
            let summary = run_sync_once_from_env(dry_run, output).await?;
            println!(
                "sync complete: run_id={} runs={} datasets={} duplicates={} failed={} rows={} loaded={} batches={}{}",
                summary.run_id,
                summary.successful_runs,
                summary.processed_datasets,
                summary.skipped_duplicates,
                summary.failed_jobs,
                summary.normalized_rows,
                summary.loaded_rows,
                summary.loaded_batches,
                if summary.dry_run { " (dry run)" } else { "" }
            );
        }
        Commands::Runs => {
            let runs = list_runs_from_env().await?;
            for run in &runs {
                println!("{}\t{}\t{}", run.id, run.default_dataset_id, run.started_at.to_rfc3339());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(err) = init_logging() {
        eprintln!("failed to initialize logging: {err:#}");
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "import failed");
            ExitCode::FAILURE
        }
    }
}
