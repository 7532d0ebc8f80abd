use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sweet_core::Fingerprint;
use sweet_storage::{FingerprintStore, SqliteStore};
use sweet_sync::{build_pipeline, open_store, CycleOutcome, LookupStatus, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sweet")]
#[command(about = "Track changes to the SEC company ticker dataset")]
struct Cli {
    /// SQLite database file (default: src/db/sweet.db under the working directory)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle
    Sync {
        /// Replace CIK_LOOKUP with the parsed tickers after recording a change
        #[arg(long)]
        load_lookup: bool,
        /// Print the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create the database schema and exit
    Init,
    /// Show recorded fingerprints, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the fingerprint of a local file
    Fingerprint { file: PathBuf },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.database {
        config.database_path = path;
    }

    match cli.command.unwrap_or(Commands::Sync {
        load_lookup: false,
        json: false,
    }) {
        Commands::Sync { load_lookup, json } => {
            config.load_lookup |= load_lookup;
            let pipeline = build_pipeline(&config).await?;
            let report = pipeline.run_once().await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing cycle report")?
                );
            } else {
                let detail = match &report.outcome {
                    CycleOutcome::Unchanged => "no change detected".to_string(),
                    CycleOutcome::Recorded { record, entries, lookup } => {
                        let lookup = match lookup {
                            LookupStatus::Skipped => String::new(),
                            LookupStatus::Loaded { rows } => format!(" lookup_rows={rows}"),
                            LookupStatus::Failed { error } => format!(" lookup_error={error:?}"),
                        };
                        format!("recorded id={} entries={entries}{lookup}", record.id)
                    }
                    CycleOutcome::RecordedParseFailed { record, error } => {
                        format!("recorded id={} parse_error={error:?}", record.id)
                    }
                };
                println!(
                    "sync complete: run_id={} outcome={} fingerprint={} bytes={} {}",
                    report.run_id,
                    report.outcome.kind(),
                    report.fingerprint,
                    report.payload_bytes,
                    detail
                );
            }
        }
        Commands::Init => {
            let store = open_store(&config)
                .await
                .with_context(|| format!("opening store {}", config.database_path.display()))?;
            store.initialize().await.context("initializing schema")?;
            info!(path = %config.database_path.display(), "schema ready");
        }
        Commands::History { limit } => {
            let store = SqliteStore::open_existing(&config.database_path, config.store_timeout)
                .await
                .with_context(|| format!("opening store {}", config.database_path.display()))?;
            for record in store.history(limit).await.context("reading history")? {
                println!("{}\t{}\t{}", record.id, record.recorded_at.to_rfc3339(), record.fingerprint);
            }
        }
        Commands::Fingerprint { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            println!("{}", Fingerprint::of(&bytes));
        }
    }

    Ok(())
}
