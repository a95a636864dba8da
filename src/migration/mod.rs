// ABOUTME: Migration engine module
// ABOUTME: Classification, export, transfer, import, verification, and phase scheduling

pub mod access_control;
pub mod classifier;
pub mod compression;
pub mod context;
pub mod estimation;
pub mod exporter;
pub mod importer;
pub mod layout;
pub mod scheduler;
pub mod verify;

pub use classifier::classify;
pub use context::{Interrupted, MigrationContext};
pub use estimation::{format_bytes, format_duration, summarize, ClassSummary};
pub use exporter::{export_unit, plan_windows, BatchWindow};
pub use importer::{import_unit, register_discovered};
pub use layout::RunLayout;
pub use scheduler::{PhaseScheduler, PhaseSummary, RunMode, RunSummary, UnitOutcome};
pub use verify::{diff_aggregates, verify, Discrepancy, Finding, VerificationReport};
