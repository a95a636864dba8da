// ABOUTME: Source/destination reconciliation by per-table aggregates
// ABOUTME: Compares row counts (and optional checksums) and reports every discrepancy

use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::fmt;

use super::classifier::classify;
use super::context::MigrationContext;
use crate::checkpoint::CheckpointEvent;
use crate::endpoint::{DatabaseEndpoint, TableAggregate};
use crate::unit::{QualifiedName, UnitKind, UnitState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    RowCount { source: u64, destination: u64 },
    Checksum { source: u64, destination: u64 },
    MissingOnDestination,
    MissingOnSource,
    /// The aggregate could not be read on one side
    Unreadable { side: String, error: String },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::RowCount {
                source,
                destination,
            } => write!(f, "row count differs (source {}, destination {})", source, destination),
            Discrepancy::Checksum {
                source,
                destination,
            } => write!(
                f,
                "checksum differs (source {:#x}, destination {:#x})",
                source, destination
            ),
            Discrepancy::MissingOnDestination => f.write_str("missing on destination"),
            Discrepancy::MissingOnSource => f.write_str("missing on source"),
            Discrepancy::Unreadable { side, error } => {
                write!(f, "could not read {} aggregate: {}", side, error)
            }
        }
    }
}

/// One table that did not reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub table: QualifiedName,
    pub discrepancy: Discrepancy,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.table, self.discrepancy)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub matched: Vec<QualifiedName>,
    pub findings: Vec<Finding>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Compare aggregates table by table
///
/// Checksums are compared only when both sides have one. The report lists
/// exactly the tables whose aggregates differ or exist on one side only.
pub fn diff_aggregates(
    source: &BTreeMap<QualifiedName, TableAggregate>,
    destination: &BTreeMap<QualifiedName, TableAggregate>,
) -> VerificationReport {
    let mut report = VerificationReport::default();

    for (table, src) in source {
        let Some(dst) = destination.get(table) else {
            report.findings.push(Finding {
                table: table.clone(),
                discrepancy: Discrepancy::MissingOnDestination,
            });
            continue;
        };
        let discrepancy = if src.rows != dst.rows {
            Some(Discrepancy::RowCount {
                source: src.rows,
                destination: dst.rows,
            })
        } else {
            match (src.checksum, dst.checksum) {
                (Some(s), Some(d)) if s != d => Some(Discrepancy::Checksum {
                    source: s,
                    destination: d,
                }),
                _ => None,
            }
        };
        match discrepancy {
            Some(discrepancy) => report.findings.push(Finding {
                table: table.clone(),
                discrepancy,
            }),
            None => report.matched.push(table.clone()),
        }
    }

    for table in destination.keys() {
        if !source.contains_key(table) {
            report.findings.push(Finding {
                table: table.clone(),
                discrepancy: Discrepancy::MissingOnSource,
            });
        }
    }

    report.findings.sort_by(|a, b| a.table.cmp(&b.table));
    report
}

/// Read aggregates for `tables` with bounded concurrency
///
/// Tables whose aggregate cannot be read are returned as findings instead.
pub async fn collect_aggregates(
    endpoint: &dyn DatabaseEndpoint,
    tables: &[QualifiedName],
    with_checksum: bool,
    concurrency: usize,
) -> (BTreeMap<QualifiedName, TableAggregate>, Vec<Finding>) {
    let results: Vec<_> = stream::iter(tables.iter().cloned())
        .map(|table| async move {
            let result = endpoint.table_aggregate(&table, with_checksum).await;
            (table, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut aggregates = BTreeMap::new();
    let mut unreadable = Vec::new();
    for (table, result) in results {
        match result {
            Ok(aggregate) => {
                aggregates.insert(table, aggregate);
            }
            Err(e) => unreadable.push(Finding {
                table,
                discrepancy: Discrepancy::Unreadable {
                    side: endpoint.label().to_string(),
                    error: format!("{:#}", e),
                },
            }),
        }
    }
    (aggregates, unreadable)
}

/// Reconcile every selected data table between source and destination
///
/// Results are recorded against units this run's checkpoint log knows:
/// matches become `Verified`, mismatches are logged as `MismatchDetected`.
pub async fn verify(ctx: &MigrationContext) -> Result<VerificationReport> {
    let source = ctx.source()?;
    let destination = ctx.destination()?;
    let with_checksum = ctx.config.verify_checksums;
    let workers = ctx.config.workers;

    let source_tables = data_tables(source, ctx).await?;
    let destination_tables = data_tables(destination, ctx).await?;
    tracing::info!(
        "Verifying {} source table(s) against {} destination table(s){}",
        source_tables.len(),
        destination_tables.len(),
        if with_checksum { " with checksums" } else { "" }
    );

    let ((src, mut src_unreadable), (dst, dst_unreadable)) = tokio::join!(
        collect_aggregates(source, &source_tables, with_checksum, workers),
        collect_aggregates(destination, &destination_tables, with_checksum, workers),
    );

    let mut report = diff_aggregates(&src, &dst);
    // A table unreadable on one side is reported once, not also as missing
    let unreadable_tables: Vec<QualifiedName> = src_unreadable
        .iter()
        .chain(dst_unreadable.iter())
        .map(|f| f.table.clone())
        .collect();
    report.findings.retain(|f| !unreadable_tables.contains(&f.table));
    src_unreadable.extend(dst_unreadable);
    report.findings.extend(src_unreadable);
    report.findings.sort_by(|a, b| a.table.cmp(&b.table));

    record_results(ctx, &report).await?;
    Ok(report)
}

async fn data_tables(endpoint: &dyn DatabaseEndpoint, ctx: &MigrationContext) -> Result<Vec<QualifiedName>> {
    Ok(classify(endpoint, &ctx.config)
        .await?
        .into_iter()
        .filter(|u| u.kind == UnitKind::DataTable)
        .map(|u| u.name)
        .collect())
}

async fn record_results(ctx: &MigrationContext, report: &VerificationReport) -> Result<()> {
    for table in &report.matched {
        if ctx.store.current_state(table) == Some(UnitState::Imported) {
            ctx.store
                .record_event(table, CheckpointEvent::Verified, "")
                .await?;
        }
    }
    for finding in &report.findings {
        let (source_rows, destination_rows) = match &finding.discrepancy {
            Discrepancy::RowCount {
                source,
                destination,
            } => (Some(*source), Some(*destination)),
            _ => (None, None),
        };
        if ctx.store.unit(&finding.table).is_some() {
            ctx.store
                .record_event(
                    &finding.table,
                    CheckpointEvent::MismatchDetected {
                        source_rows,
                        destination_rows,
                    },
                    finding.discrepancy.to_string(),
                )
                .await?;
        }
    }
    Ok(())
}
