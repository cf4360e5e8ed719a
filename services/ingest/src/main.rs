//! Batch ingest for the medical channel warehouse.
//!
//! ```text
//! medgram-ingest migrate
//! medgram-ingest load [--messages-dir DIR] [--dry-run]
//! medgram-ingest enrich [--images-dir DIR] [--dry-run]
//! medgram-ingest export-detections [--output FILE]
//! medgram-ingest import-detections FILE [--model-version NAME]
//! ```
//!
//! Configuration is loaded from `config/ingest.*`, `/etc/medgram/ingest.*`,
//! the file given with `--config`, `MEDGRAM_INGEST__*` variables and the
//! `DB_*` variables, in that order. Run reports are printed to stdout as
//! JSON; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medgram_ingest::config::{DetectorConfig, IngestConfig, LoggingConfig};
use medgram_ingest::{
    export_detections, import_detections, Detector, Enricher, EnricherSettings, FsCapture, Loader,
    LoaderSettings,
};
use medgram_storage::{InMemoryWarehouse, PgWarehouse, WarehouseStore};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "medgram-ingest", version, about = "Load and enrich archived Telegram channel captures")]
struct Cli {
    /// Extra configuration file layered over the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply warehouse migrations
    Migrate,

    /// Load raw message batches
    Load {
        #[arg(long)]
        messages_dir: Option<PathBuf>,

        /// Run against an in-memory store; nothing is persisted
        #[arg(long)]
        dry_run: bool,
    },

    /// Run object detection over captured images
    Enrich {
        #[arg(long)]
        images_dir: Option<PathBuf>,

        /// Run against an in-memory store; nothing is persisted
        #[arg(long)]
        dry_run: bool,
    },

    /// Write all detection rows as CSV
    ExportDetections {
        #[arg(long, default_value = "data/yolo_detections.csv")]
        output: PathBuf,
    },

    /// Record detection rows from a CSV file
    ImportDetections {
        input: PathBuf,

        /// Model version recorded for the imported rows
        #[arg(long, default_value = "csv-import")]
        model_version: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        IngestConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_logging(&config.logging)?;

    info!(
        service = "medgram-ingest",
        version = env!("CARGO_PKG_VERSION"),
        "Starting ingest"
    );

    config.validate().context("Invalid configuration")?;

    let result = run(cli.command, &mut config).await;
    if let Err(e) = &result {
        error!(error = %e, "Ingest failed");
    }
    result
}

async fn run(command: Command, config: &mut IngestConfig) -> Result<()> {
    match command {
        Command::Migrate => {
            let store = PgWarehouse::connect(&config.database)
                .await
                .context("Failed to connect to warehouse")?;
            store
                .run_migrations()
                .await
                .context("Failed to run database migrations")?;
        }

        Command::Load {
            messages_dir,
            dry_run,
        } => {
            if let Some(dir) = messages_dir {
                config.capture.messages_dir = dir;
            }
            let store = open_store(config, dry_run).await?;
            let loader = Loader::new(store, LoaderSettings::from(&config.loading));

            let report = loader.load(&capture(config)).await?;
            print_report(&report)?;
        }

        Command::Enrich {
            images_dir,
            dry_run,
        } => {
            if let Some(dir) = images_dir {
                config.capture.images_dir = dir;
            }
            let detector = build_detector(&config.detector)?;
            let store = open_store(config, dry_run).await?;
            let enricher =
                Enricher::new(store, detector, EnricherSettings::from(&config.enrichment));

            let report = enricher.enrich_capture(&capture(config)).await?;
            print_report(&report)?;
        }

        Command::ExportDetections { output } => {
            let store = open_store(config, false).await?;
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;

            let rows = export_detections(store.as_ref(), BufWriter::new(file)).await?;
            info!(rows, output = %output.display(), "Export written");
        }

        Command::ImportDetections {
            input,
            model_version,
        } => {
            let store = open_store(config, false).await?;
            let file = File::open(&input)
                .with_context(|| format!("Failed to open {}", input.display()))?;

            let report =
                import_detections(store.as_ref(), BufReader::new(file), &model_version).await?;
            print_report(&report)?;
        }
    }

    Ok(())
}

fn capture(config: &IngestConfig) -> FsCapture {
    FsCapture::new(
        &config.capture.messages_dir,
        &config.capture.images_dir,
        config.capture.image_extensions.clone(),
    )
}

async fn open_store(config: &IngestConfig, dry_run: bool) -> Result<Arc<dyn WarehouseStore>> {
    if dry_run {
        info!("Dry run: using an in-memory warehouse");
        return Ok(Arc::new(InMemoryWarehouse::new()));
    }

    let store = PgWarehouse::connect(&config.database)
        .await
        .context("Failed to connect to warehouse")?;

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Arc::new(store))
}

#[cfg(feature = "onnx")]
fn build_detector(config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    let detector = medgram_ingest::OnnxDetector::new(config).with_context(|| {
        format!("Failed to load detector model {}", config.model_path.display())
    })?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "onnx"))]
fn build_detector(_config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    anyhow::bail!("built without the `onnx` feature; rebuild with `--features onnx` to run detection")
}

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("medgram_ingest={}", level).parse()?)
        .add_directive(format!("medgram_storage={}", level).parse()?)
        .add_directive("sqlx=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        "compact" => subscriber
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
        _ => subscriber
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }

    Ok(())
}
