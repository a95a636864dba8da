// ABOUTME: Assessment summaries and transfer time prediction
// ABOUTME: Groups classified units by kind and estimates how long the data phase will take

use std::time::Duration;

use crate::unit::{MigrationUnit, UnitKind, UnitState};

/// Per-kind totals shown by `assess`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSummary {
    pub kind: UnitKind,
    pub objects: usize,
    /// Objects that could not be classified
    pub failed: usize,
    pub rows: u64,
    pub bytes: u64,
}

impl ClassSummary {
    fn new(kind: UnitKind) -> Self {
        Self {
            kind,
            objects: 0,
            failed: 0,
            rows: 0,
            bytes: 0,
        }
    }

    /// Estimated time to export, ship, and import this class's data
    pub fn estimated_duration(&self) -> Duration {
        estimate_transfer_duration(self.bytes)
    }
}

/// Summarize units per kind in phase order, omitting empty kinds
pub fn summarize(units: &[MigrationUnit]) -> Vec<ClassSummary> {
    let mut summaries: Vec<ClassSummary> = Vec::new();
    for unit in units {
        let index = match summaries.iter().position(|s| s.kind == unit.kind) {
            Some(index) => index,
            None => {
                summaries.push(ClassSummary::new(unit.kind));
                summaries.len() - 1
            }
        };
        let summary = &mut summaries[index];
        summary.objects += 1;
        if unit.state == UnitState::Failed {
            summary.failed += 1;
        }
        summary.rows += unit.row_count.unwrap_or(0);
        summary.bytes += unit.total_bytes.unwrap_or(0);
    }
    summaries.sort_by_key(|s| s.kind.phase());
    summaries
}

/// Estimate end-to-end migration time for `size_bytes` of table data
///
/// Uses a conservative 20 GB/hour for the combined export, compression,
/// transfer, and import. Compressed on-disk size is what the catalog reports,
/// so the figure tracks what actually crosses the wire.
fn estimate_transfer_duration(size_bytes: u64) -> Duration {
    const BYTES_PER_HOUR: f64 = 20.0 * 1024.0 * 1024.0 * 1024.0;

    let hours = size_bytes as f64 / BYTES_PER_HOUR;
    Duration::from_secs_f64(hours * 3600.0)
}

/// Format bytes into human-readable string
///
/// # Examples
///
/// ```
/// # use clickhouse_seren_migrator::migration::format_bytes;
/// assert_eq!(format_bytes(1024), "1.0 KB");
/// assert_eq!(format_bytes(1536), "1.5 KB");
/// assert_eq!(format_bytes(1073741824), "1.0 GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.1} {}", size, UNITS[unit_idx])
}

/// Format duration into human-readable string
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use clickhouse_seren_migrator::migration::format_duration;
/// assert_eq!(format_duration(Duration::from_secs(45)), "~45 seconds");
/// assert_eq!(format_duration(Duration::from_secs(7200)), "~2.0 hours");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("~{} seconds", secs)
    } else if secs < 3600 {
        format!("~{:.1} minutes", secs as f64 / 60.0)
    } else if secs < 86400 {
        format!("~{:.1} hours", secs as f64 / 3600.0)
    } else {
        format!("~{:.1} days", secs as f64 / 86400.0)
    }
}
