// ABOUTME: Assess command implementation
// ABOUTME: Classifies the source catalog, registers units, and prints a size and time estimate

use anyhow::Result;

use crate::migration::{classify, format_bytes, format_duration, summarize, ClassSummary, MigrationContext};
use crate::unit::{MigrationUnit, UnitState};

/// Classify the source and record every unit in the checkpoint log
///
/// Re-running assessment never disturbs units the log already tracks; new
/// objects are added as `Pending`. Objects whose catalog entry could not be
/// read are registered as failed and listed in the output.
pub async fn assess(ctx: &MigrationContext) -> Result<Vec<ClassSummary>> {
    let source = ctx.source()?;
    tracing::info!("Assessing {} instance...", source.label());

    let units = classify(source, &ctx.config).await?;
    let mut added = 0;
    for unit in &units {
        if ctx.store.register(unit).await? {
            added += 1;
        }
    }
    tracing::info!(
        "✓ Classified {} unit(s), {} new to this run",
        units.len(),
        added
    );

    let summaries = summarize(&units);
    print_assessment(&summaries, &units);
    Ok(summaries)
}

fn print_assessment(summaries: &[ClassSummary], units: &[MigrationUnit]) {
    println!();
    println!("========================================");
    println!("Migration Assessment");
    println!("========================================");
    println!();
    println!(
        "{:<20} {:>8} {:>14} {:>12} {:>16}",
        "Kind", "Objects", "Rows", "Size", "Est. Time"
    );
    println!("{}", "-".repeat(74));
    let mut total_bytes = 0;
    for summary in summaries {
        total_bytes += summary.bytes;
        println!(
            "{:<20} {:>8} {:>14} {:>12} {:>16}",
            summary.kind.as_str(),
            summary.objects,
            summary.rows,
            format_bytes(summary.bytes),
            format_duration(summary.estimated_duration())
        );
    }
    println!("{}", "-".repeat(74));
    println!("Total data: {}", format_bytes(total_bytes));
    println!();

    let failed: Vec<&MigrationUnit> = units
        .iter()
        .filter(|u| u.state == UnitState::Failed)
        .collect();
    if !failed.is_empty() {
        println!("Objects that could not be classified: {}", failed.len());
        for unit in failed {
            println!(
                "  ✗ {}: {}",
                unit.name,
                unit.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        println!();
    }
}
