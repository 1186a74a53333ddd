//! # Tabload CLI
//!
//! Discover tabular data files in a source location, validate them against
//! the declared source catalog, stage them in the warehouse, and merge
//! them into their target tables.
//!
//! ## Usage
//!
//! ```bash
//! # Process every file in the configured source location
//! tabload process
//!
//! # Process a single named file
//! tabload process --file sales_2024.csv
//!
//! # Override the configured locations for one run
//! tabload process --directory-path /data/incoming --archive-path /data/archive
//! ```
//!
//! Configuration comes from `TABLOAD_`-prefixed environment variables;
//! see `Settings` in `tabload-core`. Exit code is 0 iff no file had an
//! unhandled failure.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tabload_core::{load_catalog, Settings, SourceRegistry};
use tabload_db::Warehouse;
use tabload_io::notify::{EmailNotifier, WebhookNotifier};
use tabload_io::store::FileStore;
use tabload_pipeline::{FileResult, Processor};

#[derive(Parser, Debug)]
#[command(name = "tabload")]
#[command(about = "Parallel file-ingestion pipeline for relational warehouses")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process files from the source location in parallel
    Process(ProcessArgs),
}

#[derive(clap::Args, Debug)]
struct ProcessArgs {
    /// Process a single named file (including its extension)
    #[arg(short, long)]
    file: Option<String>,

    /// Override the configured source directory or URI
    #[arg(short, long)]
    directory_path: Option<String>,

    /// Override the configured archive location
    #[arg(short, long)]
    archive_path: Option<String>,

    /// Override the configured duplicate-files location
    #[arg(long)]
    duplicate_files_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut settings = Settings::load().context("loading settings")?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Process(args) => {
            if let Some(path) = args.directory_path {
                settings.directory_path = path;
            }
            if let Some(path) = args.archive_path {
                settings.archive_path = path;
            }
            if let Some(path) = args.duplicate_files_path {
                settings.duplicate_files_path = path;
            }
            let results = process(&settings, args.file).await?;
            let unhandled = results
                .iter()
                .filter(|r| r.outcome == Some(false))
                .count();
            if unhandled == 0 {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{unhandled} file(s) failed; see the lineage log for details");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn process(settings: &Settings, file: Option<String>) -> Result<Vec<FileResult>> {
    let sources = load_catalog(&settings.catalog_path).context("loading source catalog")?;
    let registry = Arc::new(SourceRegistry::register(sources).context("registering sources")?);

    let warehouse = Warehouse::connect(&settings.database_url)
        .await
        .context("connecting to warehouse")?;
    warehouse
        .create_tables(&registry)
        .await
        .context("bootstrapping warehouse tables")?;

    let store = Arc::new(
        FileStore::resolve(
            &settings.directory_path,
            &settings.archive_path,
            &settings.duplicate_files_path,
            settings.file_helper_platform,
        )
        .context("resolving storage locations")?,
    );
    let email = Arc::new(EmailNotifier::new(
        settings.smtp_host.clone(),
        settings.smtp_port,
        settings.smtp_user.clone(),
        settings.smtp_password.clone(),
        settings.from_email.clone(),
        settings.data_team_email.clone(),
    ));
    let webhook = WebhookNotifier::new(settings.webhook_url.clone());

    let processor = Processor::new(
        warehouse,
        store,
        registry,
        email,
        webhook,
        settings.batch_size,
        None,
    );

    if let Some(filename) = file {
        return Ok(vec![processor.process_one(&filename).await]);
    }

    // Ctrl-C stops dispatching new files; in-flight files run to
    // completion before the pool drains.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C, shutting down after in-flight files...");
            signal_cancel.cancel();
        }
    });

    processor.process_all(cancel).await.context("processing files")
}
