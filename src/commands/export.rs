// ABOUTME: Export command implementation
// ABOUTME: Exports one object or the whole selection, importing directly when a destination is set

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::migration::{classify, MigrationContext, PhaseScheduler, RunMode, RunSummary};
use crate::unit::{MigrationUnit, QualifiedName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    /// Every unit the filter selects
    All,
    /// One object, or a database together with all of its objects
    Object(QualifiedName),
}

/// Export the target units phase by phase
///
/// Units already complete in the checkpoint log are skipped, failed ones are
/// retried. With a destination configured each unit is imported right after
/// its export, inside its own phase.
pub async fn export(ctx: Arc<MigrationContext>, target: ExportTarget) -> Result<RunSummary> {
    let source = ctx.source()?;
    let units = classify(source, &ctx.config).await?;
    for unit in &units {
        ctx.store.register(unit).await?;
    }

    let selected = select(&units, &target)?;
    tracing::info!(
        "Exporting {} unit(s){}",
        selected.len(),
        if ctx.is_direct() {
            " with direct import"
        } else {
            ""
        }
    );

    let summary = PhaseScheduler::new(Arc::clone(&ctx), RunMode::Export)
        .run(&selected)
        .await?;
    print_summary("Export", &summary);
    Ok(summary)
}

fn select(units: &[MigrationUnit], target: &ExportTarget) -> Result<Vec<QualifiedName>> {
    let selected: Vec<QualifiedName> = match target {
        ExportTarget::All => units.iter().map(|u| u.name.clone()).collect(),
        ExportTarget::Object(name) if name.is_database() => units
            .iter()
            .filter(|u| u.name.namespace == name.namespace)
            .map(|u| u.name.clone())
            .collect(),
        ExportTarget::Object(name) => units
            .iter()
            .filter(|u| &u.name == name)
            .map(|u| u.name.clone())
            .collect(),
    };
    if selected.is_empty() {
        match target {
            ExportTarget::All => tracing::warn!("⚠ No objects selected for export"),
            ExportTarget::Object(name) => {
                bail!("'{}' was not found on the source or is excluded by the filter", name)
            }
        }
    }
    Ok(selected)
}

pub(crate) fn print_summary(label: &str, summary: &RunSummary) {
    println!();
    println!("{} summary:", label);
    println!("{}", summary);
    if !summary.failed_units.is_empty() {
        println!();
        println!("Failed units (re-run or use `resume` to retry):");
        for name in &summary.failed_units {
            println!("  ✗ {}", name);
        }
    }
    println!();
}
