// ABOUTME: Durable append-only checkpoint log with an in-memory per-unit index
// ABOUTME: Provides resume support, run manifests with hashed identities, and unit claims

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncWriteExt;

use crate::unit::{MigrationUnit, QualifiedName, UnitKind, UnitState};

const RUN_MANIFEST_VERSION: u32 = 1;

/// Error taxonomy for per-unit failures
///
/// Attached to errors as anyhow context and recovered with `downcast_ref`
/// at the unit-worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EndpointUnreachable,
    CatalogFailure,
    SchemaExportFailure,
    SchemaImportFailure,
    BatchExportFailure,
    BatchTransferFailure,
    BatchImportFailure,
    AccessControlFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::EndpointUnreachable => "endpoint unreachable",
            FailureKind::CatalogFailure => "catalog query failed",
            FailureKind::SchemaExportFailure => "schema export failed",
            FailureKind::SchemaImportFailure => "schema import failed",
            FailureKind::BatchExportFailure => "batch export failed",
            FailureKind::BatchTransferFailure => "batch transfer failed",
            FailureKind::BatchImportFailure => "batch import failed",
            FailureKind::AccessControlFailure => "access control replay failed",
        };
        f.write_str(label)
    }
}

impl FailureKind {
    /// Find the failure kind attached to an error as context
    pub fn of(err: &anyhow::Error) -> Option<FailureKind> {
        err.downcast_ref::<FailureKind>().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CheckpointEvent {
    Discovered {
        kind: UnitKind,
        row_count: Option<u64>,
        total_bytes: Option<u64>,
    },
    SchemaExported,
    ExportStarted {
        row_count: u64,
    },
    BatchExported {
        index: u64,
        row_offset: u64,
        row_count: u64,
        size_bytes: u64,
    },
    DataExported,
    BatchTransferred {
        index: u64,
    },
    Transferred,
    BatchImported {
        index: u64,
    },
    Imported,
    Verified,
    MismatchDetected {
        source_rows: Option<u64>,
        destination_rows: Option<u64>,
    },
    Failed {
        kind: FailureKind,
    },
    Reset,
}

impl CheckpointEvent {
    fn label(&self) -> &'static str {
        match self {
            CheckpointEvent::Discovered { .. } => "discovered",
            CheckpointEvent::SchemaExported => "schema_exported",
            CheckpointEvent::ExportStarted { .. } => "export_started",
            CheckpointEvent::BatchExported { .. } => "batch_exported",
            CheckpointEvent::DataExported => "data_exported",
            CheckpointEvent::BatchTransferred { .. } => "batch_transferred",
            CheckpointEvent::Transferred => "transferred",
            CheckpointEvent::BatchImported { .. } => "batch_imported",
            CheckpointEvent::Imported => "imported",
            CheckpointEvent::Verified => "verified",
            CheckpointEvent::MismatchDetected { .. } => "mismatch_detected",
            CheckpointEvent::Failed { .. } => "failed",
            CheckpointEvent::Reset => "reset",
        }
    }
}

/// One line of the checkpoint log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub timestamp: DateTime<Utc>,
    pub unit: QualifiedName,
    #[serde(flatten)]
    pub event: CheckpointEvent,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Append-only checkpoint log plus the index rebuilt from it
///
/// Durable appends are serialized through a single writer; index updates
/// only lock the entry of the unit being changed.
pub struct CheckpointStore {
    path: PathBuf,
    writer: tokio::sync::Mutex<tokio::fs::File>,
    index: RwLock<HashMap<QualifiedName, Arc<Mutex<MigrationUnit>>>>,
    claims: Arc<Mutex<HashSet<QualifiedName>>>,
}

impl CheckpointStore {
    /// Open (or create) the log at `path` and replay it into the index
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create checkpoint directory {}", parent.display())
            })?;
        }

        let records = replay_log(path)?;
        let mut index: HashMap<QualifiedName, MigrationUnit> = HashMap::new();
        for record in &records {
            apply_record(&mut index, record);
        }
        tracing::debug!(
            "Replayed {} checkpoint record(s) for {} unit(s) from {}",
            records.len(),
            index.len(),
            path.display()
        );

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open checkpoint log at {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: tokio::sync::Mutex::new(file),
            index: RwLock::new(
                index
                    .into_iter()
                    .map(|(name, unit)| (name, Arc::new(Mutex::new(unit))))
                    .collect(),
            ),
            claims: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event durably, then fold it into the unit's index entry
    ///
    /// Returns only after the record has been flushed to disk.
    pub async fn record_event(
        &self,
        unit: &QualifiedName,
        event: CheckpointEvent,
        detail: impl Into<String>,
    ) -> Result<()> {
        let detail = detail.into();
        let entry = self.entry(unit);

        match (&entry, &event) {
            (Some(entry), _) => lock_unit(entry).check(&event)?,
            (None, CheckpointEvent::Discovered { .. }) => {}
            (None, _) => bail!(
                "Unit '{}' must be discovered before recording '{}'",
                unit,
                event.label()
            ),
        }

        let record = CheckpointRecord {
            timestamp: Utc::now(),
            unit: unit.clone(),
            event,
            detail,
        };
        let mut line = serde_json::to_string(&record)
            .with_context(|| format!("Failed to serialize checkpoint record for '{}'", unit))?;
        line.push('\n');

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await.with_context(|| {
                format!("Failed to append checkpoint log at {}", self.path.display())
            })?;
            writer.sync_data().await.with_context(|| {
                format!("Failed to flush checkpoint log at {}", self.path.display())
            })?;
        }

        match entry {
            Some(entry) => lock_unit(&entry).apply(&record.event, &record.detail),
            None => {
                let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
                let entry = index.entry(unit.clone()).or_insert_with(|| {
                    let kind = match &record.event {
                        CheckpointEvent::Discovered { kind, .. } => *kind,
                        _ => UnitKind::DataTable,
                    };
                    Arc::new(Mutex::new(MigrationUnit::new(unit.clone(), kind)))
                });
                lock_unit(entry).apply(&record.event, &record.detail);
            }
        }

        tracing::debug!("Checkpoint '{}': {}", unit, record.event.label());
        Ok(())
    }

    /// Register a classified unit unless the log already knows it
    ///
    /// Returns true when a new `Discovered` record was appended.
    pub async fn register(&self, unit: &MigrationUnit) -> Result<bool> {
        if self.entry(&unit.name).is_some() {
            return Ok(false);
        }
        self.record_event(
            &unit.name,
            CheckpointEvent::Discovered {
                kind: unit.kind,
                row_count: unit.row_count,
                total_bytes: unit.total_bytes,
            },
            "",
        )
        .await?;
        if unit.state == UnitState::Failed {
            let kind = FailureKind::CatalogFailure;
            self.record_event(
                &unit.name,
                CheckpointEvent::Failed { kind },
                unit.last_error.clone().unwrap_or_default(),
            )
            .await?;
        }
        Ok(true)
    }

    pub fn current_state(&self, unit: &QualifiedName) -> Option<UnitState> {
        self.entry(unit).map(|entry| lock_unit(&entry).state)
    }

    pub fn is_complete(&self, unit: &QualifiedName) -> bool {
        self.current_state(unit)
            .map(UnitState::is_complete)
            .unwrap_or(false)
    }

    /// Snapshot of one unit
    pub fn unit(&self, unit: &QualifiedName) -> Option<MigrationUnit> {
        self.entry(unit).map(|entry| lock_unit(&entry).clone())
    }

    /// Snapshot of every known unit, ordered by phase then name
    pub fn units(&self) -> Vec<MigrationUnit> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let mut units: Vec<MigrationUnit> =
            index.values().map(|entry| lock_unit(entry).clone()).collect();
        units.sort_by(|a, b| (a.phase(), &a.name).cmp(&(b.phase(), &b.name)));
        units
    }

    /// Take exclusive processing rights for a unit
    ///
    /// The claim is released when the returned guard drops.
    pub fn claim(&self, unit: &QualifiedName) -> Result<UnitClaim> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if !claims.insert(unit.clone()) {
            bail!("Unit '{}' is already being processed", unit);
        }
        Ok(UnitClaim {
            unit: unit.clone(),
            claims: Arc::clone(&self.claims),
        })
    }

    pub async fn flush(&self) -> Result<()> {
        let writer = self.writer.lock().await;
        writer
            .sync_all()
            .await
            .with_context(|| format!("Failed to flush checkpoint log at {}", self.path.display()))
    }

    fn entry(&self, unit: &QualifiedName) -> Option<Arc<Mutex<MigrationUnit>>> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.get(unit).cloned()
    }
}

pub struct UnitClaim {
    unit: QualifiedName,
    claims: Arc<Mutex<HashSet<QualifiedName>>>,
}

impl Drop for UnitClaim {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.remove(&self.unit);
    }
}

fn lock_unit(entry: &Mutex<MigrationUnit>) -> std::sync::MutexGuard<'_, MigrationUnit> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

fn apply_record(index: &mut HashMap<QualifiedName, MigrationUnit>, record: &CheckpointRecord) {
    let unit = index.entry(record.unit.clone()).or_insert_with(|| {
        let kind = match &record.event {
            CheckpointEvent::Discovered { kind, .. } => *kind,
            _ => UnitKind::DataTable,
        };
        MigrationUnit::new(record.unit.clone(), kind)
    });
    unit.apply(&record.event, &record.detail);
}

/// Read every complete record of a checkpoint log
///
/// A torn final line (crash mid-append) is dropped; damage anywhere else is
/// reported as an error.
fn replay_log(path: &Path) -> Result<Vec<CheckpointRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read checkpoint log at {}", path.display()))?;
    let lines: Vec<&str> = content.lines().collect();
    let ends_cleanly = content.ends_with('\n');
    let mut records = Vec::with_capacity(lines.len());

    for (number, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CheckpointRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if number + 1 == lines.len() && !ends_cleanly => {
                tracing::warn!(
                    "Ignoring incomplete trailing checkpoint record in {}: {}",
                    path.display(),
                    e
                );
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Corrupt checkpoint record at {}:{}",
                        path.display(),
                        number + 1
                    )
                })
            }
        }
    }

    Ok(records)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunManifest {
    pub version: u32,
    pub source_hash: String,
    pub destination_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn new(source_url: &str, destination_url: Option<&str>) -> Self {
        Self {
            version: RUN_MANIFEST_VERSION,
            source_hash: hash_string(source_url),
            destination_hash: destination_url.map(hash_string),
            created_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run manifest at {}", path.display()))?;
        let manifest: RunManifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run manifest JSON at {}", path.display()))?;

        if manifest.version != RUN_MANIFEST_VERSION {
            bail!(
                "Run manifest version mismatch (found {}, expected {}). Use a fresh run directory.",
                manifest.version,
                RUN_MANIFEST_VERSION
            );
        }

        Ok(Some(manifest))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create run directory {}", parent.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp manifest in {}", parent.display()))?;

        serde_json::to_writer_pretty(tmp.as_file_mut(), self)
            .with_context(|| format!("Failed to serialize run manifest at {}", path.display()))?;

        tmp.persist(path)
            .with_context(|| format!("Failed to persist run manifest at {}", path.display()))?;

        Ok(())
    }

    /// Refuse to reuse a run directory that belongs to another source
    pub fn validate(&self, other: &RunManifest) -> Result<()> {
        if self.source_hash != other.source_hash {
            bail!(
                "Run directory was created for a different source endpoint. Use a fresh run directory."
            );
        }
        if let (Some(ours), Some(theirs)) = (&self.destination_hash, &other.destination_hash) {
            if ours != theirs {
                bail!(
                    "Run directory was created for a different destination endpoint. Use a fresh run directory."
                );
            }
        }
        Ok(())
    }

    /// Load the manifest at `path`, validating it against `current`, or
    /// persist `current` when the run directory is new.
    pub fn load_or_create(path: &Path, current: RunManifest) -> Result<RunManifest> {
        match Self::load(path)? {
            Some(existing) => {
                existing.validate(&current)?;
                Ok(existing)
            }
            None => {
                current.save(path)?;
                Ok(current)
            }
        }
    }
}

fn hash_string(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
