// ABOUTME: Import of one migration unit into the destination instance
// ABOUTME: Applies definitions idempotently and replays batch files in row order

use anyhow::{anyhow, Context, Result};

use super::access_control;
use super::compression::gunzip;
use super::context::MigrationContext;
use super::exporter::snapshot;
use super::layout::{BatchFile, DiscoveredUnit};
use crate::checkpoint::{CheckpointEvent, FailureKind};
use crate::endpoint::{is_already_exists, DatabaseEndpoint};
use crate::unit::{MigrationUnit, QualifiedName, UnitKind, UnitState};
use crate::utils::quote_ident;

/// Register units found in the run directory with the import log
///
/// Returns the discovered units in phase order.
pub async fn register_discovered(ctx: &MigrationContext) -> Result<Vec<DiscoveredUnit>> {
    let discovered = ctx
        .layout
        .discover()
        .await
        .with_context(|| format!("Failed to scan run directory {}", ctx.layout.root().display()))?;
    for found in &discovered {
        ctx.store
            .register(&MigrationUnit::new(found.name.clone(), found.kind))
            .await?;
    }
    Ok(discovered)
}

/// Apply one unit's definition and data to the destination
pub async fn import_unit(ctx: &MigrationContext, name: &QualifiedName) -> Result<()> {
    let destination = ctx.destination()?;
    let unit = snapshot(ctx, name)?;
    if unit.state.is_complete() {
        return Ok(());
    }

    if unit.kind == UnitKind::AccessControlBundle {
        return access_control::import_bundle(ctx, destination, name).await;
    }

    if !unit.name.is_database() {
        ensure_namespace(destination, &unit.name.namespace).await?;
    }
    apply_definition(ctx, destination, &unit).await?;

    let mut imported_rows = 0;
    if unit.kind == UnitKind::DataTable {
        let batches = ctx.layout.batch_files(name).await?;
        if let Some(expected) = expected_batches(&unit) {
            if batches.len() as u64 != expected {
                return Err(anyhow!(
                    "Found {} batch file(s) for '{}' but {} were exported",
                    batches.len(),
                    name,
                    expected
                )
                .context(FailureKind::BatchImportFailure));
            }
        }
        for batch in &batches {
            ctx.check_cancelled()?;
            if unit.batch(batch.index).is_some_and(|b| b.imported) {
                continue;
            }
            imported_rows += import_batch(ctx, destination, name, batch).await?;
            ctx.store
                .record_event(name, CheckpointEvent::BatchImported { index: batch.index }, "")
                .await?;
        }
    }

    ctx.store
        .record_event(name, CheckpointEvent::Imported, destination.label())
        .await?;
    if unit.kind == UnitKind::DataTable {
        tracing::info!("✓ Imported {} ({} rows this run)", name, imported_rows);
    } else {
        tracing::info!("✓ Created {} ({})", name, unit.kind);
    }
    Ok(())
}

/// Batches the export side produced, when this log knows it
fn expected_batches(unit: &MigrationUnit) -> Option<u64> {
    if unit.state.reached(UnitState::DataExported) && unit.batches.iter().all(|b| b.size_bytes > 0) {
        Some(unit.batches.len() as u64)
    } else {
        None
    }
}

async fn ensure_namespace(destination: &dyn DatabaseEndpoint, namespace: &str) -> Result<()> {
    destination
        .execute(&format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(namespace)))
        .await
        .with_context(|| format!("Failed to create database '{}' on destination", namespace))
        .context(FailureKind::SchemaImportFailure)
}

async fn apply_definition(
    ctx: &MigrationContext,
    destination: &dyn DatabaseEndpoint,
    unit: &MigrationUnit,
) -> Result<()> {
    let path = ctx.layout.absolute(&ctx.layout.schema_file(&unit.name)?);
    let ddl = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read definition {}", path.display()))
        .context(FailureKind::SchemaImportFailure)?;

    match destination.execute(ddl.trim()).await {
        Ok(()) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            tracing::debug!("{} already exists on destination", unit.name);
            Ok(())
        }
        Err(e) => Err(e)
            .with_context(|| format!("Failed to create {} '{}'", unit.kind, unit.name))
            .context(FailureKind::SchemaImportFailure),
    }
}

/// Load one batch file; a failed load is retried once before giving up
async fn import_batch(
    ctx: &MigrationContext,
    destination: &dyn DatabaseEndpoint,
    name: &QualifiedName,
    batch: &BatchFile,
) -> Result<u64> {
    let path = ctx.layout.absolute(&batch.path);
    let compressed = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
        .context(FailureKind::BatchImportFailure)?;
    let data = gunzip(compressed)
        .await
        .with_context(|| format!("Corrupt batch file {}", path.display()))
        .context(FailureKind::BatchImportFailure)?;

    let rows = match destination.import_rows(name, batch.format, data.clone()).await {
        Ok(rows) => rows,
        Err(first) => {
            tracing::warn!(
                "⚠ Import of batch {} into {} failed, retrying once: {:#}",
                batch.index,
                name,
                first
            );
            destination
                .import_rows(name, batch.format, data)
                .await
                .with_context(|| format!("Failed to import batch {} into '{}'", batch.index, name))
                .context(FailureKind::BatchImportFailure)?
        }
    };
    tracing::debug!("Imported batch {} into {} ({} rows)", batch.index, name, rows);
    Ok(rows)
}
