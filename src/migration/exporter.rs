// ABOUTME: Export of one migration unit from the source instance
// ABOUTME: Captures definitions, extracts table data in bounded batches, and ships files onward

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::access_control;
use super::compression::gzip;
use super::context::{Interrupted, MigrationContext};
use super::layout::write_atomic;
use crate::checkpoint::{CheckpointEvent, FailureKind};
use crate::endpoint::DatabaseEndpoint;
use crate::transport::{self, Transport};
use crate::unit::{BatchRecord, MigrationUnit, QualifiedName, UnitKind, UnitState};
use crate::utils::{pace, retry_with_backoff};

/// Row range covered by one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub index: u64,
    pub row_offset: u64,
    pub row_count: u64,
}

impl BatchWindow {
    fn matches(&self, record: &BatchRecord) -> bool {
        record.row_offset == self.row_offset && record.row_count == self.row_count
    }
}

/// Split `[0, total_rows)` into contiguous batch windows
///
/// Batches already recorded for the unit are kept as long as they form a
/// gap-free prefix starting at row 0 with indices `0..n`; the remainder is
/// planned with `batch_size`. Windows are returned in index order, which is
/// also row order.
pub fn plan_windows(total_rows: u64, batch_size: u64, existing: &[BatchRecord]) -> Vec<BatchWindow> {
    let batch_size = batch_size.max(1);
    let mut sorted: Vec<&BatchRecord> = existing.iter().collect();
    sorted.sort_by_key(|b| b.row_offset);

    let mut windows = Vec::new();
    let mut cursor = 0;
    for batch in sorted {
        let next_index = windows.len() as u64;
        if batch.row_offset != cursor
            || batch.index != next_index
            || batch.row_count == 0
            || batch.row_end() > total_rows
        {
            break;
        }
        windows.push(BatchWindow {
            index: batch.index,
            row_offset: batch.row_offset,
            row_count: batch.row_count,
        });
        cursor = batch.row_end();
    }

    while cursor < total_rows {
        let row_count = batch_size.min(total_rows - cursor);
        windows.push(BatchWindow {
            index: windows.len() as u64,
            row_offset: cursor,
            row_count,
        });
        cursor += row_count;
    }
    windows
}

/// Run one unit through export (and transfer when a transport is configured)
///
/// Every step that completes is checkpointed before the next begins, so a
/// rerun picks up at the first step without a durable record.
pub async fn export_unit(ctx: &MigrationContext, name: &QualifiedName) -> Result<()> {
    let source = ctx.source()?;
    let unit = snapshot(ctx, name)?;

    if unit.kind == UnitKind::AccessControlBundle {
        if !unit.state.reached(UnitState::SchemaExported) {
            access_control::export_bundle(ctx, source, name).await?;
        }
    } else {
        if !unit.state.reached(UnitState::SchemaExported) {
            export_definition(ctx, source, &unit).await?;
        }
        if unit.kind == UnitKind::DataTable && !unit.state.reached(UnitState::DataExported) {
            export_data(ctx, source, name).await?;
        }
    }

    if let Some(transport) = &ctx.transport {
        if !snapshot(ctx, name)?.state.reached(UnitState::Transferred) {
            ship_definition(ctx, transport.as_ref(), &unit).await?;
            ctx.store
                .record_event(name, CheckpointEvent::Transferred, transport.describe())
                .await?;
        }
    }
    Ok(())
}

pub(crate) fn snapshot(ctx: &MigrationContext, name: &QualifiedName) -> Result<MigrationUnit> {
    ctx.store
        .unit(name)
        .with_context(|| format!("Unit '{}' is not registered in {}", name, ctx.store.path().display()))
}

async fn export_definition(
    ctx: &MigrationContext,
    source: &dyn DatabaseEndpoint,
    unit: &MigrationUnit,
) -> Result<()> {
    let ddl = retry_with_backoff(
        || source.describe_schema(&unit.name, unit.kind),
        ctx.config.max_retries,
        ctx.config.retry_delay,
    )
    .await
    .with_context(|| format!("Failed to capture definition of '{}'", unit.name))
    .context(FailureKind::SchemaExportFailure)?;

    let layout = &ctx.layout;
    write_atomic(&layout.absolute(&layout.schema_file(&unit.name)?), ddl.as_bytes()).await?;
    write_kind_marker(ctx, unit).await?;

    ctx.store
        .record_event(&unit.name, CheckpointEvent::SchemaExported, "")
        .await?;
    tracing::info!("✓ Captured definition of {} ({})", unit.name, unit.kind);
    Ok(())
}

pub(crate) async fn write_kind_marker(ctx: &MigrationContext, unit: &MigrationUnit) -> Result<()> {
    let layout = &ctx.layout;
    let path = layout.absolute(&layout.kind_file(&unit.name)?);
    write_atomic(&path, format!("{}\n", unit.kind).as_bytes()).await
}

async fn export_data(
    ctx: &MigrationContext,
    source: &dyn DatabaseEndpoint,
    name: &QualifiedName,
) -> Result<()> {
    let unit = snapshot(ctx, name)?;
    let format = ctx.config.format;

    let total_rows = match unit.row_count {
        Some(rows) if !unit.batches.is_empty() => rows,
        _ => {
            let stats = retry_with_backoff(
                || source.table_stats(name),
                ctx.config.max_retries,
                ctx.config.retry_delay,
            )
            .await
            .with_context(|| format!("Failed to count rows of '{}'", name))
            .context(FailureKind::BatchExportFailure)?;
            ctx.store
                .record_event(
                    name,
                    CheckpointEvent::ExportStarted {
                        row_count: stats.rows,
                    },
                    "",
                )
                .await?;
            stats.rows
        }
    };

    let batch_size = ctx.config.batch_size_for(unit.attempts);
    let windows = plan_windows(total_rows, batch_size, &unit.batches);
    remove_stale_batches(ctx, &unit, &windows).await?;

    tracing::info!(
        "Exporting {} ({} rows in {} batch(es) of up to {})",
        name,
        total_rows,
        windows.len(),
        batch_size
    );

    for (position, window) in windows.iter().enumerate() {
        ctx.check_cancelled()?;
        let recorded = unit.batch(window.index).filter(|b| window.matches(b));
        if recorded.is_some_and(|b| b.transferred) {
            continue;
        }

        let relative = ctx.layout.batch_file(name, window.index, format)?;
        let local = ctx.layout.absolute(&relative);
        let on_disk = match recorded {
            Some(batch) => file_has_size(&local, batch.size_bytes).await,
            None => false,
        };

        if !on_disk {
            let size_bytes = export_batch(ctx, source, name, window, &local).await?;
            ctx.store
                .record_event(
                    name,
                    CheckpointEvent::BatchExported {
                        index: window.index,
                        row_offset: window.row_offset,
                        row_count: window.row_count,
                        size_bytes,
                    },
                    relative.display().to_string(),
                )
                .await?;
        } else if ctx.transport.is_none() {
            continue;
        }

        if let Some(transport) = &ctx.transport {
            transport::ship(
                transport.as_ref(),
                &local,
                &relative,
                ctx.config.max_retries,
                ctx.config.retry_delay,
            )
            .await
            .with_context(|| format!("Failed to transfer batch {} of '{}'", window.index, name))
            .context(FailureKind::BatchTransferFailure)?;
            ctx.store
                .record_event(
                    name,
                    CheckpointEvent::BatchTransferred {
                        index: window.index,
                    },
                    "",
                )
                .await?;
        }

        if position + 1 < windows.len() && !pace(ctx.config.batch_delay, &ctx.cancel).await {
            return Err(Interrupted.into());
        }
    }

    match source.table_stats(name).await {
        Ok(stats) if stats.rows > total_rows => tracing::warn!(
            "⚠ {} grew from {} to {} rows during export; rows past the snapshot are not part of this run",
            name,
            total_rows,
            stats.rows
        ),
        Ok(stats) if stats.rows < total_rows => tracing::warn!(
            "⚠ {} shrank from {} to {} rows during export",
            name,
            total_rows,
            stats.rows
        ),
        Ok(_) => {}
        Err(e) => tracing::debug!("Could not re-count {} after export: {:#}", name, e),
    }

    ctx.store
        .record_event(
            name,
            CheckpointEvent::DataExported,
            format!("{} batch(es)", windows.len()),
        )
        .await?;
    tracing::info!("✓ Exported {} ({} rows)", name, total_rows);
    Ok(())
}

/// Extract, compress, and write one batch; returns the compressed size
async fn export_batch(
    ctx: &MigrationContext,
    source: &dyn DatabaseEndpoint,
    name: &QualifiedName,
    window: &BatchWindow,
    local: &Path,
) -> Result<u64> {
    let format = ctx.config.format;
    let data = retry_with_backoff(
        || source.export_rows(name, format, window.row_offset, window.row_count),
        ctx.config.max_retries,
        ctx.config.retry_delay,
    )
    .await
    .with_context(|| {
        format!(
            "Failed to export rows {}..{} of '{}'",
            window.row_offset,
            window.row_offset + window.row_count,
            name
        )
    })
    .context(FailureKind::BatchExportFailure)?;

    if data.is_empty() {
        return Err(anyhow!(
            "Batch {} of '{}' (rows {}..{}) came back empty",
            window.index,
            name,
            window.row_offset,
            window.row_offset + window.row_count
        )
        .context(FailureKind::BatchExportFailure));
    }

    let compressed = gzip(data).await?;
    write_atomic(local, &compressed).await?;
    tracing::debug!(
        "Wrote batch {} of {} ({} bytes compressed)",
        window.index,
        name,
        compressed.len()
    );
    Ok(compressed.len() as u64)
}

/// Delete local batch files the new plan no longer covers
async fn remove_stale_batches(
    ctx: &MigrationContext,
    unit: &MigrationUnit,
    windows: &[BatchWindow],
) -> Result<()> {
    for batch in &unit.batches {
        if windows.iter().any(|w| w.index == batch.index && w.matches(batch)) {
            continue;
        }
        let path = ctx
            .layout
            .absolute(&ctx.layout.batch_file(&unit.name, batch.index, ctx.config.format)?);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::warn!(
                "Discarded out-of-plan batch {} of {}",
                batch.index,
                unit.name
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
            }
        }
    }
    Ok(())
}

async fn file_has_size(path: &Path, expected: u64) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.len() == expected && expected > 0)
}

/// Files describing a unit, in shipping order
///
/// The kind marker always goes last: its arrival tells the destination that
/// everything else for the unit is in place.
async fn definition_files(ctx: &MigrationContext, unit: &MigrationUnit) -> Result<Vec<PathBuf>> {
    let layout = &ctx.layout;
    let mut files = Vec::new();
    if unit.kind == UnitKind::AccessControlBundle {
        for entity in crate::endpoint::AccessEntity::REPLAY_ORDER {
            let relative = layout.access_control_file(entity);
            if tokio::fs::metadata(layout.absolute(&relative)).await.is_ok() {
                files.push(relative);
            }
        }
    } else {
        files.push(layout.schema_file(&unit.name)?);
    }
    files.push(layout.kind_file(&unit.name)?);
    Ok(files)
}

async fn ship_definition(
    ctx: &MigrationContext,
    transport: &dyn Transport,
    unit: &MigrationUnit,
) -> Result<()> {
    let failure = if unit.kind == UnitKind::AccessControlBundle {
        FailureKind::AccessControlFailure
    } else {
        FailureKind::BatchTransferFailure
    };
    for relative in definition_files(ctx, unit).await? {
        transport::ship(
            transport,
            &ctx.layout.absolute(&relative),
            &relative,
            ctx.config.max_retries,
            ctx.config.retry_delay,
        )
        .await
        .with_context(|| format!("Failed to transfer definition of '{}'", unit.name))
        .context(failure)?;
    }
    Ok(())
}
