// ABOUTME: Phase-ordered scheduler running units through a bounded worker pool
// ABOUTME: Enforces a barrier between phases, isolates unit failures, and honours cancellation

use futures::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::context::{Interrupted, MigrationContext};
use super::{classifier, exporter, importer};
use crate::checkpoint::{CheckpointEvent, FailureKind};
use crate::unit::{MigrationUnit, Phase, QualifiedName, UnitKind, UnitState};
use crate::utils::pace;

/// Which side of the migration a run drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Export from the source; also imports when a destination is attached
    Export,
    /// Import files already present in the run directory
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Migrated,
    Skipped,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseSummary {
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub interrupted: usize,
}

impl PhaseSummary {
    fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Migrated => self.migrated += 1,
            UnitOutcome::Skipped => self.skipped += 1,
            UnitOutcome::Failed => self.failed += 1,
            UnitOutcome::Interrupted => self.interrupted += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub phases: BTreeMap<Phase, PhaseSummary>,
    pub failed_units: Vec<QualifiedName>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn total(&self) -> PhaseSummary {
        let mut total = PhaseSummary::default();
        for phase in self.phases.values() {
            total.migrated += phase.migrated;
            total.skipped += phase.skipped;
            total.failed += phase.failed;
            total.interrupted += phase.interrupted;
        }
        total
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.total().failed == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (phase, summary) in &self.phases {
            writeln!(
                f,
                "  {:<18} {:>5} migrated {:>5} skipped {:>5} failed",
                phase.as_str(),
                summary.migrated,
                summary.skipped,
                summary.failed
            )?;
        }
        let total = self.total();
        write!(
            f,
            "  {:<18} {:>5} migrated {:>5} skipped {:>5} failed",
            "total", total.migrated, total.skipped, total.failed
        )?;
        if self.cancelled {
            write!(f, "\n  run was cancelled; {} unit(s) interrupted", total.interrupted)?;
        }
        Ok(())
    }
}

/// Runs units phase by phase with at most `workers` in flight
///
/// No unit of a phase starts before every unit of the previous phase has
/// reached a terminal outcome for this run.
pub struct PhaseScheduler {
    ctx: Arc<MigrationContext>,
    mode: RunMode,
}

impl PhaseScheduler {
    pub fn new(ctx: Arc<MigrationContext>, mode: RunMode) -> Self {
        Self { ctx, mode }
    }

    /// Whether a unit needs no further work in this mode
    pub fn is_done(&self, unit: &MigrationUnit) -> bool {
        let state = unit.state;
        if state.is_complete() {
            return true;
        }
        if self.mode == RunMode::Import || self.ctx.destination.is_some() {
            return false;
        }
        if self.ctx.transport.is_some() {
            return state.reached(UnitState::Transferred);
        }
        match unit.kind {
            UnitKind::DataTable => state.reached(UnitState::DataExported),
            _ => state.reached(UnitState::SchemaExported),
        }
    }

    /// Process the named units, which must already be registered
    ///
    /// Objects found by re-listing a database whose catalog failed earlier
    /// join their own, later phases of the same run.
    pub async fn run(&self, names: &[QualifiedName]) -> anyhow::Result<RunSummary> {
        let mut by_phase: BTreeMap<Phase, Vec<MigrationUnit>> = BTreeMap::new();
        for name in names {
            enqueue(&mut by_phase, exporter::snapshot(&self.ctx, name)?);
        }

        let mut summary = RunSummary::default();
        for phase in Phase::ALL {
            let Some(mut units) = by_phase.remove(&phase) else {
                continue;
            };
            if self.ctx.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            units.sort_by(|a, b| a.name.cmp(&b.name));

            let (phase_summary, failed, discovered) = self.run_phase(phase, units).await;
            for name in &discovered {
                let unit = exporter::snapshot(&self.ctx, name)?;
                if unit.phase() > phase {
                    enqueue(&mut by_phase, unit);
                }
            }
            if phase_summary.failed > 0 {
                tracing::warn!(
                    "⚠ Phase {} finished with {} failed unit(s); dependent objects in later phases may fail too",
                    phase,
                    phase_summary.failed
                );
            }
            summary.failed_units.extend(failed);
            summary.phases.insert(phase, phase_summary);
        }

        if self.ctx.cancel.is_cancelled() {
            summary.cancelled = true;
        }
        self.ctx.store.flush().await?;
        Ok(summary)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        units: Vec<MigrationUnit>,
    ) -> (PhaseSummary, Vec<QualifiedName>, Vec<QualifiedName>) {
        let mut summary = PhaseSummary::default();
        let mut failed = Vec::new();
        let mut discovered = Vec::new();
        let pending: Vec<MigrationUnit> = units
            .into_iter()
            .filter(|unit| {
                if self.is_done(unit) {
                    tracing::debug!("Skipping {} ({})", unit.name, unit.state);
                    summary.record(UnitOutcome::Skipped);
                    false
                } else {
                    true
                }
            })
            .collect();

        if pending.is_empty() {
            return (summary, failed, discovered);
        }
        tracing::info!("Phase {}: {} unit(s) to process", phase, pending.len());

        let progress = self.progress_bar(phase, pending.len());
        let permits = Arc::new(Semaphore::new(self.ctx.config.workers));
        let mut workers = JoinSet::new();

        for (launched, unit) in pending.into_iter().enumerate() {
            if launched > 0 && !pace(self.ctx.config.object_delay, &self.ctx.cancel).await {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.ctx.cancel.cancelled() => break,
            };
            let ctx = Arc::clone(&self.ctx);
            let mode = self.mode;
            workers.spawn(async move {
                let result = AssertUnwindSafe(process_unit(&ctx, mode, &unit.name))
                    .catch_unwind()
                    .await;
                let (outcome, found) = match result {
                    Ok(processed) => processed,
                    Err(panic) => {
                        let detail = format!("worker panicked: {}", panic_message(panic.as_ref()));
                        record_failure(&ctx, &unit.name, default_failure(mode), detail).await;
                        (UnitOutcome::Failed, Vec::new())
                    }
                };
                drop(permit);
                (unit.name, outcome, found)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((name, outcome, found)) => {
                    if outcome == UnitOutcome::Failed {
                        failed.push(name.clone());
                    }
                    discovered.extend(found);
                    progress.set_message(name.to_string());
                    summary.record(outcome);
                }
                Err(e) => {
                    tracing::error!("✗ Worker task ended abnormally: {}", e);
                    summary.record(UnitOutcome::Failed);
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        (summary, failed, discovered)
    }

    fn progress_bar(&self, phase: Phase, len: usize) -> ProgressBar {
        if !self.ctx.config.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template("{prefix:>18} [{bar:30}] {pos}/{len} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.set_prefix(phase.to_string());
        bar
    }
}

fn enqueue(by_phase: &mut BTreeMap<Phase, Vec<MigrationUnit>>, unit: MigrationUnit) {
    let phase_units = by_phase.entry(unit.phase()).or_default();
    if !phase_units.iter().any(|u| u.name == unit.name) {
        phase_units.push(unit);
    }
}

fn default_failure(mode: RunMode) -> FailureKind {
    match mode {
        RunMode::Export => FailureKind::BatchExportFailure,
        RunMode::Import => FailureKind::BatchImportFailure,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn record_failure(ctx: &MigrationContext, name: &QualifiedName, kind: FailureKind, detail: String) {
    tracing::error!("✗ {} failed ({}): {}", name, kind, detail);
    if let Err(e) = ctx
        .store
        .record_event(name, CheckpointEvent::Failed { kind }, detail)
        .await
    {
        tracing::error!("✗ Could not record failure of {}: {:#}", name, e);
    }
}

/// Run one unit to completion for this mode, recording any failure
///
/// Also returns the objects registered by re-listing a database whose
/// catalog could not be read before.
async fn process_unit(
    ctx: &MigrationContext,
    mode: RunMode,
    name: &QualifiedName,
) -> (UnitOutcome, Vec<QualifiedName>) {
    let _claim = match ctx.store.claim(name) {
        Ok(claim) => claim,
        Err(e) => {
            tracing::warn!("⚠ {:#}", e);
            return (UnitOutcome::Skipped, Vec::new());
        }
    };

    let Some(unit) = ctx.store.unit(name) else {
        tracing::error!("✗ Unit '{}' is not registered", name);
        return (UnitOutcome::Failed, Vec::new());
    };
    let relist = mode == RunMode::Export
        && unit.kind == UnitKind::Database
        && unit.state == UnitState::Failed
        && unit.failure == Some(FailureKind::CatalogFailure);

    if unit.state == UnitState::Failed {
        if let Err(e) = ctx
            .store
            .record_event(name, CheckpointEvent::Reset, "retrying")
            .await
        {
            tracing::error!("✗ Could not reset {}: {:#}", name, e);
            return (UnitOutcome::Failed, Vec::new());
        }
    }

    let mut discovered = Vec::new();
    let result = run_unit(ctx, mode, name, relist, &mut discovered).await;

    match result {
        Ok(()) => (UnitOutcome::Migrated, discovered),
        Err(e) if Interrupted::is(&e) => {
            tracing::info!("{} interrupted; it will resume from its last checkpoint", name);
            (UnitOutcome::Interrupted, discovered)
        }
        Err(e) => {
            let kind = FailureKind::of(&e).unwrap_or(default_failure(mode));
            record_failure(ctx, name, kind, format!("{:#}", e)).await;
            (UnitOutcome::Failed, discovered)
        }
    }
}

async fn run_unit(
    ctx: &MigrationContext,
    mode: RunMode,
    name: &QualifiedName,
    relist: bool,
    discovered: &mut Vec<QualifiedName>,
) -> anyhow::Result<()> {
    if relist {
        *discovered = relist_namespace(ctx, name).await?;
    }
    match mode {
        RunMode::Export => {
            exporter::export_unit(ctx, name).await?;
            if ctx.destination.is_some() {
                importer::import_unit(ctx, name).await?;
            }
            Ok(())
        }
        RunMode::Import => importer::import_unit(ctx, name).await,
    }
}

/// List a database's objects again and register the ones the log lacks
async fn relist_namespace(ctx: &MigrationContext, database: &QualifiedName) -> anyhow::Result<Vec<QualifiedName>> {
    let source = ctx.source()?;
    let objects = classifier::classify_namespace(source, &ctx.config, &database.namespace).await?;
    let mut names = Vec::with_capacity(objects.len());
    for object in &objects {
        ctx.store.register(object).await?;
        names.push(object.name.clone());
    }
    tracing::info!("Listed {} object(s) in {}", names.len(), database);
    Ok(names)
}
