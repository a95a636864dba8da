// ABOUTME: Command implementations for each stage of a migration
// ABOUTME: Exports assess, export, import, verify, resume, status, and switchover-check

pub mod assess;
pub mod export;
pub mod import;
pub mod resume;
pub mod status;
pub mod switchover;
pub mod verify;

pub use assess::assess;
pub use export::{export, ExportTarget};
pub use import::import;
pub use resume::resume;
pub use status::status;
pub use switchover::switchover_check;
pub use verify::verify;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, RunManifest};
use crate::clickhouse;
use crate::config::MigrationConfig;
use crate::endpoint::DatabaseEndpoint;
use crate::migration::{MigrationContext, RunLayout};
use crate::transport;

/// Context for commands driven from the source side
///
/// Connects to the source, and to the destination when one is configured.
/// The run directory's manifest pins it to these endpoints.
pub async fn source_context(
    config: Arc<MigrationConfig>,
    cancel: CancellationToken,
) -> Result<Arc<MigrationContext>> {
    let source_config = config.require_source()?;
    let layout = RunLayout::new(&config.run_dir);
    RunManifest::load_or_create(
        &layout.manifest(),
        RunManifest::new(
            &source_config.url,
            config.destination.as_ref().map(|d| d.url.as_str()),
        ),
    )?;

    let store = Arc::new(CheckpointStore::open(&layout.checkpoint_log()).await?);
    let source: Arc<dyn DatabaseEndpoint> =
        Arc::new(clickhouse::connect_with_retry(source_config, "source").await?);

    let mut ctx = MigrationContext::new(Arc::clone(&config), store, layout)
        .with_source(source)
        .with_cancel(cancel);
    if let Some(destination_config) = &config.destination {
        let destination: Arc<dyn DatabaseEndpoint> =
            Arc::new(clickhouse::connect_with_retry(destination_config, "destination").await?);
        ctx = ctx.with_destination(destination);
    }
    if let Some(transport_config) = &config.transport {
        let transport = transport::from_config(transport_config)
            .context("Failed to set up file transport")?;
        tracing::info!("Shipping files via {}", transport.describe());
        ctx = ctx.with_transport(transport);
    }
    Ok(Arc::new(ctx))
}

/// Context for commands run on the destination host against shipped files
pub async fn destination_context(
    config: Arc<MigrationConfig>,
    cancel: CancellationToken,
) -> Result<Arc<MigrationContext>> {
    let destination_config = config.require_destination()?;
    let layout = RunLayout::new(&config.run_dir);
    let store = Arc::new(CheckpointStore::open(&layout.import_log()).await?);
    let destination: Arc<dyn DatabaseEndpoint> =
        Arc::new(clickhouse::connect_with_retry(destination_config, "destination").await?);

    Ok(Arc::new(
        MigrationContext::new(Arc::clone(&config), store, layout)
            .with_destination(destination)
            .with_cancel(cancel),
    ))
}
