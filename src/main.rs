// ABOUTME: CLI entry point for clickhouse-seren-migrator
// ABOUTME: Parses commands, loads configuration, and routes to the command handlers

use anyhow::Result;
use clap::{Parser, Subcommand};
use clickhouse_seren_migrator::commands::{self, ExportTarget};
use clickhouse_seren_migrator::config::{ConfigOverrides, MigrationConfig};
use clickhouse_seren_migrator::migration::{RunLayout, RunMode};
use clickhouse_seren_migrator::switchover::SwitchoverDecision;
use clickhouse_seren_migrator::unit::QualifiedName;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "clickhouse-seren-migrator")]
#[command(about = "Resumable, phase-ordered ClickHouse migration", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Source endpoint URL (overrides [source].url)
    #[arg(long, global = true)]
    source: Option<String>,
    /// Destination endpoint URL (overrides [destination].url)
    #[arg(long, global = true)]
    destination: Option<String>,
    /// Run directory holding checkpoints and exported files
    #[arg(long, global = true)]
    run_dir: Option<PathBuf>,
    /// Maximum units processed concurrently within a phase
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Rows per export batch
    #[arg(long, global = true)]
    batch_size: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the source catalog and estimate the migration
    Assess,
    /// Export one object (database or database.object) or everything selected
    Export {
        /// Object to export, e.g. `sales.orders` or `sales`
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        object: Option<QualifiedName>,
        /// Export every selected object
        #[arg(long)]
        all: bool,
    },
    /// Import exported files from the run directory into the destination
    Import {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Compare row counts (and checksums if enabled) between source and destination
    Verify,
    /// Retry units that previously failed
    Resume {
        /// Resume the destination-side import instead of the export
        #[arg(long)]
        import: bool,
    },
    /// Show per-unit progress of the run
    Status {
        /// Show the destination-side import log
        #[arg(long)]
        import: bool,
    },
    /// Check whether destination replication lag allows switchover
    SwitchoverCheck,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging - default to INFO level if RUST_LOG not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(MigrationConfig::load(
        cli.config.as_deref(),
        ConfigOverrides {
            source: cli.source,
            destination: cli.destination,
            run_dir: cli.run_dir,
            workers: cli.workers,
            batch_size: cli.batch_size,
        },
    )?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; finishing in-flight steps and stopping...");
                cancel.cancel();
            }
        });
    }

    let success = match cli.command {
        Commands::Assess => {
            let ctx = commands::source_context(config, cancel).await?;
            commands::assess(&ctx).await?;
            true
        }
        Commands::Export { object, all: _ } => {
            let target = match object {
                Some(name) => ExportTarget::Object(name),
                None => ExportTarget::All,
            };
            let ctx = commands::source_context(config, cancel).await?;
            commands::export(ctx, target).await?.is_success()
        }
        Commands::Import { yes } => {
            let ctx = commands::destination_context(config, cancel).await?;
            commands::import(ctx, yes).await?.is_success()
        }
        Commands::Verify => {
            config.require_destination()?;
            let ctx = commands::source_context(config, cancel).await?;
            commands::verify(&ctx).await?.is_clean()
        }
        Commands::Resume { import } => {
            let (ctx, mode) = if import {
                (
                    commands::destination_context(config, cancel).await?,
                    RunMode::Import,
                )
            } else {
                (
                    commands::source_context(config, cancel).await?,
                    RunMode::Export,
                )
            };
            commands::resume(ctx, mode).await?.is_success()
        }
        Commands::Status { import } => {
            commands::status(&RunLayout::new(&config.run_dir), import).await? == 0
        }
        Commands::SwitchoverCheck => {
            let destination = clickhouse_seren_migrator::clickhouse::connect_with_retry(
                config.require_destination()?,
                "destination",
            )
            .await?;
            matches!(
                commands::switchover_check(&destination, &config.switchover).await?,
                SwitchoverDecision::Proceed { .. }
            )
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
