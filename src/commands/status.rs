// ABOUTME: Status command implementation
// ABOUTME: Prints per-unit progress rebuilt from a run's checkpoint log

use anyhow::{bail, Result};

use crate::checkpoint::CheckpointStore;
use crate::migration::{format_bytes, RunLayout};
use crate::unit::{MigrationUnit, UnitKind, UnitState};

/// Show the state of every unit in a run directory
///
/// Reads the export log, or the destination's import log when
/// `import_side` is set. Returns the number of failed units.
pub async fn status(layout: &RunLayout, import_side: bool) -> Result<usize> {
    let path = if import_side {
        layout.import_log()
    } else {
        layout.checkpoint_log()
    };
    if !path.exists() {
        bail!("No migration run found at {}", path.display());
    }

    let store = CheckpointStore::open(&path).await?;
    let units = store.units();
    print_status(&units);
    Ok(units.iter().filter(|u| u.state == UnitState::Failed).count())
}

fn progress_of(unit: &MigrationUnit) -> String {
    if unit.kind != UnitKind::DataTable || unit.batches.is_empty() {
        return String::new();
    }
    let imported = unit.batches.iter().filter(|b| b.imported).count();
    let transferred = unit.transferred_batches();
    let bytes: u64 = unit.batches.iter().map(|b| b.size_bytes).sum();
    format!(
        "{} batch(es), {} transferred, {} imported, {}",
        unit.batches.len(),
        transferred,
        imported,
        format_bytes(bytes)
    )
}

fn print_status(units: &[MigrationUnit]) {
    println!();
    println!("{:<48} {:<18} {:<16} Progress", "Unit", "Kind", "State");
    println!("{}", "-".repeat(100));
    for unit in units {
        println!(
            "{:<48} {:<18} {:<16} {}",
            unit.name.to_string(),
            unit.kind.as_str(),
            unit.state.as_str(),
            progress_of(unit)
        );
        if unit.state == UnitState::Failed {
            if let Some(error) = &unit.last_error {
                println!("    ✗ {}", error.lines().next().unwrap_or_default());
            }
        }
    }
    println!("{}", "-".repeat(100));

    let complete = units.iter().filter(|u| u.state.is_complete()).count();
    let failed = units.iter().filter(|u| u.state == UnitState::Failed).count();
    println!(
        "{} unit(s): {} complete, {} failed, {} in progress",
        units.len(),
        complete,
        failed,
        units.len() - complete - failed
    );
    println!();
}
