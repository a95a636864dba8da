// ABOUTME: Resume command implementation
// ABOUTME: Re-runs only the units whose latest recorded state is Failed

use anyhow::Result;
use std::sync::Arc;

use super::export::print_summary;
use crate::migration::{MigrationContext, PhaseScheduler, RunMode, RunSummary};
use crate::unit::UnitState;

/// Retry failed units, each from its last durable checkpoint
///
/// Units in any other state are left alone, which makes this safe to run
/// after a partially successful export or import.
pub async fn resume(ctx: Arc<MigrationContext>, mode: RunMode) -> Result<RunSummary> {
    let failed: Vec<_> = ctx
        .store
        .units()
        .into_iter()
        .filter(|u| u.state == UnitState::Failed)
        .collect();

    if failed.is_empty() {
        tracing::info!("✓ No failed units in {}", ctx.store.path().display());
        return Ok(RunSummary::default());
    }

    for unit in &failed {
        tracing::info!(
            "Retrying {} (attempt {}): {}",
            unit.name,
            unit.attempts + 2,
            unit.last_error.as_deref().unwrap_or("no error recorded")
        );
    }

    let names: Vec<_> = failed.into_iter().map(|u| u.name).collect();
    let summary = PhaseScheduler::new(Arc::clone(&ctx), mode).run(&names).await?;
    print_summary("Resume", &summary);
    Ok(summary)
}
