// ABOUTME: Migration unit data model: qualified names, kinds, phases and states
// ABOUTME: Applies checkpoint events to units to rebuild their resumption point

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::checkpoint::{CheckpointEvent, FailureKind};

/// Namespace reserved for the access-control bundle
pub const ACCESS_CONTROL_NAMESPACE: &str = "@access_control";

/// Namespace + local name, unique within a migration run
///
/// Database units carry an empty local name, so they display as the bare
/// namespace and sort before every object inside it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct QualifiedName {
    pub namespace: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn database(namespace: impl Into<String>) -> Self {
        Self::new(namespace, "")
    }

    pub fn access_control() -> Self {
        Self::database(ACCESS_CONTROL_NAMESPACE)
    }

    pub fn is_database(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.namespace)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

impl From<QualifiedName> for String {
    fn from(value: QualifiedName) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for QualifiedName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl FromStr for QualifiedName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("Qualified name cannot be empty");
        }
        match s.split_once('.') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            Some(_) => bail!("Invalid qualified name '{}': expected 'namespace.object'", s),
            None => Ok(Self::database(s)),
        }
    }
}

/// The kind of schema object a unit migrates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Database,
    DataTable,
    /// Table whose engine proxies or streams data held elsewhere; only its
    /// definition migrates
    ProxyTable,
    Dictionary,
    MaterializedView,
    View,
    AccessControlBundle,
}

impl UnitKind {
    pub fn phase(self) -> Phase {
        match self {
            UnitKind::Database => Phase::Database,
            UnitKind::DataTable | UnitKind::ProxyTable => Phase::DataTable,
            UnitKind::Dictionary => Phase::Dictionary,
            UnitKind::MaterializedView => Phase::MaterializedView,
            UnitKind::View => Phase::View,
            UnitKind::AccessControlBundle => Phase::AccessControl,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Database => "database",
            UnitKind::DataTable => "data_table",
            UnitKind::ProxyTable => "proxy_table",
            UnitKind::Dictionary => "dictionary",
            UnitKind::MaterializedView => "materialized_view",
            UnitKind::View => "view",
            UnitKind::AccessControlBundle => "access_control",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "database" => UnitKind::Database,
            "data_table" => UnitKind::DataTable,
            "proxy_table" => UnitKind::ProxyTable,
            "dictionary" => UnitKind::Dictionary,
            "materialized_view" => UnitKind::MaterializedView,
            "view" => UnitKind::View,
            "access_control" => UnitKind::AccessControlBundle,
            other => bail!("Unknown unit kind '{}'", other),
        })
    }
}

/// Dependency-ordered migration stage
///
/// The derived ordering is the run order: databases first, access control last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Database,
    DataTable,
    Dictionary,
    MaterializedView,
    View,
    AccessControl,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Database,
        Phase::DataTable,
        Phase::Dictionary,
        Phase::MaterializedView,
        Phase::View,
        Phase::AccessControl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Database => "database",
            Phase::DataTable => "data_table",
            Phase::Dictionary => "dictionary",
            Phase::MaterializedView => "materialized_view",
            Phase::View => "view",
            Phase::AccessControl => "access_control",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    SchemaExported,
    DataExported,
    Transferred,
    Imported,
    Verified,
    Failed,
}

impl UnitState {
    fn rank(self) -> u8 {
        match self {
            UnitState::Pending => 0,
            UnitState::SchemaExported => 1,
            UnitState::DataExported => 2,
            UnitState::Transferred => 3,
            UnitState::Imported => 4,
            UnitState::Verified => 5,
            UnitState::Failed => u8::MAX,
        }
    }

    /// States move forward only; `Failed` is reachable from anywhere and
    /// leaves only back to `Pending`.
    pub fn can_transition_to(self, next: UnitState) -> bool {
        match (self, next) {
            (_, UnitState::Failed) => true,
            (UnitState::Failed, UnitState::Pending) => true,
            (UnitState::Failed, _) => false,
            (current, next) => next.rank() >= current.rank(),
        }
    }

    pub fn is_complete(self) -> bool {
        matches!(self, UnitState::Imported | UnitState::Verified)
    }

    /// True once the unit got at least as far as `other` without failing
    pub fn reached(self, other: UnitState) -> bool {
        self != UnitState::Failed && self.rank() >= other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::SchemaExported => "schema_exported",
            UnitState::DataExported => "data_exported",
            UnitState::Transferred => "transferred",
            UnitState::Imported => "imported",
            UnitState::Verified => "verified",
            UnitState::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exported row window of a data table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub index: u64,
    pub row_offset: u64,
    pub row_count: u64,
    pub size_bytes: u64,
    pub transferred: bool,
    pub imported: bool,
}

impl BatchRecord {
    pub fn row_end(&self) -> u64 {
        self.row_offset + self.row_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub name: QualifiedName,
    pub kind: UnitKind,
    pub state: UnitState,
    /// Source row count snapshot taken when data export started
    pub row_count: Option<u64>,
    pub total_bytes: Option<u64>,
    pub batches: Vec<BatchRecord>,
    /// Number of times the unit was reset from `Failed` back to `Pending`
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Kind of the most recent failure
    pub failure: Option<FailureKind>,
}

impl MigrationUnit {
    pub fn new(name: QualifiedName, kind: UnitKind) -> Self {
        Self {
            name,
            kind,
            state: UnitState::Pending,
            row_count: None,
            total_bytes: None,
            batches: Vec::new(),
            attempts: 0,
            last_error: None,
            failure: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.kind.phase()
    }

    pub fn batch(&self, index: u64) -> Option<&BatchRecord> {
        self.batches.iter().find(|b| b.index == index)
    }

    pub fn transferred_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.transferred).count()
    }

    /// The state change `event` would cause, if any
    pub fn next_state(&self, event: &CheckpointEvent) -> Option<UnitState> {
        match event {
            CheckpointEvent::SchemaExported => Some(UnitState::SchemaExported),
            CheckpointEvent::DataExported => Some(UnitState::DataExported),
            CheckpointEvent::Transferred => Some(UnitState::Transferred),
            CheckpointEvent::Imported => Some(UnitState::Imported),
            CheckpointEvent::Verified => Some(UnitState::Verified),
            CheckpointEvent::Failed { .. } => Some(UnitState::Failed),
            CheckpointEvent::Reset => Some(UnitState::Pending),
            _ => None,
        }
    }

    /// Validate that `event` is legal for the unit's current state
    pub fn check(&self, event: &CheckpointEvent) -> Result<()> {
        if let Some(next) = self.next_state(event) {
            if !self.state.can_transition_to(next) {
                bail!(
                    "Illegal state transition for '{}': {} -> {}",
                    self.name,
                    self.state,
                    next
                );
            }
        }
        Ok(())
    }

    /// Fold one checkpoint event into the unit
    pub fn apply(&mut self, event: &CheckpointEvent, detail: &str) {
        match event {
            CheckpointEvent::Discovered {
                kind,
                row_count,
                total_bytes,
            } => {
                self.kind = *kind;
                if self.batches.is_empty() {
                    self.row_count = *row_count;
                }
                self.total_bytes = *total_bytes;
            }
            CheckpointEvent::ExportStarted { row_count } => {
                self.row_count = Some(*row_count);
            }
            CheckpointEvent::BatchExported {
                index,
                row_offset,
                row_count,
                size_bytes,
            } => {
                let record = BatchRecord {
                    index: *index,
                    row_offset: *row_offset,
                    row_count: *row_count,
                    size_bytes: *size_bytes,
                    transferred: false,
                    imported: false,
                };
                match self.batches.iter_mut().find(|b| b.index == *index) {
                    Some(existing) => *existing = record,
                    None => self.batches.push(record),
                }
                self.batches.sort_by_key(|b| b.row_offset);
            }
            CheckpointEvent::BatchTransferred { index } => {
                if let Some(batch) = self.batches.iter_mut().find(|b| b.index == *index) {
                    batch.transferred = true;
                }
            }
            CheckpointEvent::BatchImported { index } => match self
                .batches
                .iter_mut()
                .find(|b| b.index == *index)
            {
                Some(batch) => batch.imported = true,
                None => {
                    // Destination-side logs learn batches from files, not exports
                    self.batches.push(BatchRecord {
                        index: *index,
                        row_offset: 0,
                        row_count: 0,
                        size_bytes: 0,
                        transferred: true,
                        imported: true,
                    });
                }
            },
            CheckpointEvent::Failed { kind } => {
                self.state = UnitState::Failed;
                self.failure = Some(*kind);
                self.last_error = Some(detail.to_string());
            }
            CheckpointEvent::Reset => {
                self.state = UnitState::Pending;
                self.attempts += 1;
            }
            CheckpointEvent::MismatchDetected { .. } => {
                self.last_error = Some(detail.to_string());
            }
            CheckpointEvent::SchemaExported
            | CheckpointEvent::DataExported
            | CheckpointEvent::Transferred
            | CheckpointEvent::Imported
            | CheckpointEvent::Verified => {
                if let Some(next) = self.next_state(event) {
                    self.state = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_fixed() {
        let mut phases = Phase::ALL.to_vec();
        phases.reverse();
        phases.sort();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert!(Phase::DataTable < Phase::MaterializedView);
        assert!(Phase::View < Phase::AccessControl);
    }

    #[test]
    fn test_qualified_name_parse_and_display() {
        let name: QualifiedName = "analytics.events".parse().unwrap();
        assert_eq!(name, QualifiedName::new("analytics", "events"));
        assert_eq!(name.to_string(), "analytics.events");

        let db: QualifiedName = "analytics".parse().unwrap();
        assert!(db.is_database());
        assert_eq!(db.to_string(), "analytics");

        assert!("".parse::<QualifiedName>().is_err());
        assert!(".events".parse::<QualifiedName>().is_err());
        assert!("analytics.".parse::<QualifiedName>().is_err());
    }

    #[test]
    fn test_database_sorts_before_its_objects() {
        let mut names = vec![
            QualifiedName::new("b", "t"),
            QualifiedName::new("a", "z"),
            QualifiedName::database("a"),
        ];
        names.sort();
        assert_eq!(names[0], QualifiedName::database("a"));
        assert_eq!(names[1], QualifiedName::new("a", "z"));
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        assert!(UnitState::Pending.can_transition_to(UnitState::SchemaExported));
        assert!(UnitState::Transferred.can_transition_to(UnitState::Imported));
        assert!(!UnitState::Imported.can_transition_to(UnitState::SchemaExported));
        assert!(UnitState::Imported.can_transition_to(UnitState::Failed));
        assert!(UnitState::Failed.can_transition_to(UnitState::Pending));
        assert!(!UnitState::Failed.can_transition_to(UnitState::Imported));
    }

    #[test]
    fn test_apply_batches_keeps_offset_order() {
        let mut unit = MigrationUnit::new(QualifiedName::new("db", "t"), UnitKind::DataTable);
        for (index, offset) in [(1u64, 100u64), (0, 0)] {
            unit.apply(
                &CheckpointEvent::BatchExported {
                    index,
                    row_offset: offset,
                    row_count: 100,
                    size_bytes: 10,
                },
                "",
            );
        }
        unit.apply(&CheckpointEvent::BatchTransferred { index: 0 }, "");

        assert_eq!(unit.batches[0].row_offset, 0);
        assert!(unit.batches[0].transferred);
        assert!(!unit.batches[1].transferred);
        assert_eq!(unit.transferred_batches(), 1);
    }

    #[test]
    fn test_reset_counts_attempts() {
        let mut unit = MigrationUnit::new(QualifiedName::new("db", "t"), UnitKind::DataTable);
        unit.apply(
            &CheckpointEvent::Failed {
                kind: FailureKind::BatchExportFailure,
            },
            "boom",
        );
        assert_eq!(unit.state, UnitState::Failed);
        assert_eq!(unit.failure, Some(FailureKind::BatchExportFailure));
        assert_eq!(unit.last_error.as_deref(), Some("boom"));
        assert!(unit.check(&CheckpointEvent::Imported).is_err());

        unit.apply(&CheckpointEvent::Reset, "");
        assert_eq!(unit.state, UnitState::Pending);
        assert_eq!(unit.attempts, 1);
    }
}
