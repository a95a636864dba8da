// ABOUTME: On-disk layout of a migration run directory
// ABOUTME: Maps units to schema, kind, and batch files and discovers them again on import

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::config::RowFormat;
use crate::endpoint::AccessEntity;
use crate::transport::{partial_path, PARTIAL_SUFFIX};
use crate::unit::{QualifiedName, UnitKind};
use crate::utils::validate_path_component;

pub const MANIFEST_FILE: &str = "run.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.log";
pub const IMPORT_LOG_FILE: &str = "import.log";
pub const SCHEMA_FILE: &str = "schema.ddl";
pub const KIND_FILE: &str = "kind.txt";
pub const ACCESS_CONTROL_DIR: &str = "access_control";

/// Names that already mean something at the top of the run directory
const RESERVED_NAMES: &[&str] = &[
    MANIFEST_FILE,
    CHECKPOINT_FILE,
    IMPORT_LOG_FILE,
    ACCESS_CONTROL_DIR,
];

/// One exported batch found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub index: u64,
    pub format: RowFormat,
    pub path: PathBuf,
}

/// A unit whose exported files were found in the run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUnit {
    pub name: QualifiedName,
    pub kind: UnitKind,
}

/// Paths inside one run directory
///
/// Relative paths are shared by both ends of a migration: the exporter writes
/// `root/<relative>` locally and the transport places the same relative path
/// under its own directory on the destination host.
///
/// ```text
/// run.json
/// checkpoint.log
/// <database>/schema.ddl
/// <database>/<object>/schema.ddl
/// <database>/<object>/batch_<n>.<format>.gz
/// access_control/<entity>.sql
/// ```
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn checkpoint_log(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn import_log(&self) -> PathBuf {
        self.root.join(IMPORT_LOG_FILE)
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Directory of a unit, relative to the run root
    ///
    /// # Security
    ///
    /// Every name component is validated so that catalog names cannot escape
    /// the run directory or shadow the run's own files.
    pub fn unit_dir(&self, name: &QualifiedName) -> Result<PathBuf> {
        if name.namespace == crate::unit::ACCESS_CONTROL_NAMESPACE {
            return Ok(PathBuf::from(ACCESS_CONTROL_DIR));
        }
        validate_path_component(&name.namespace)
            .with_context(|| format!("Database '{}' cannot be stored on disk", name.namespace))?;
        if RESERVED_NAMES.contains(&name.namespace.as_str()) {
            bail!(
                "Database '{}' collides with a reserved run directory entry",
                name.namespace
            );
        }
        if name.is_database() {
            return Ok(PathBuf::from(&name.namespace));
        }
        validate_path_component(&name.name)
            .with_context(|| format!("Object '{}' cannot be stored on disk", name))?;
        if name.name == SCHEMA_FILE || name.name == KIND_FILE {
            bail!("Object '{}' collides with a reserved file name", name);
        }
        Ok(Path::new(&name.namespace).join(&name.name))
    }

    pub fn schema_file(&self, name: &QualifiedName) -> Result<PathBuf> {
        Ok(self.unit_dir(name)?.join(SCHEMA_FILE))
    }

    pub fn kind_file(&self, name: &QualifiedName) -> Result<PathBuf> {
        Ok(self.unit_dir(name)?.join(KIND_FILE))
    }

    pub fn batch_file(&self, name: &QualifiedName, index: u64, format: RowFormat) -> Result<PathBuf> {
        Ok(self.unit_dir(name)?.join(batch_file_name(index, format)))
    }

    pub fn access_control_file(&self, entity: AccessEntity) -> PathBuf {
        Path::new(ACCESS_CONTROL_DIR).join(entity.file_name())
    }

    /// Batch files of a unit in index order
    ///
    /// Files still carrying the partial marker are ignored.
    pub async fn batch_files(&self, name: &QualifiedName) -> Result<Vec<BatchFile>> {
        let relative = self.unit_dir(name)?;
        let dir = self.absolute(&relative);
        let mut batches = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(batches),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", dir.display()));
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some((index, format)) = parse_batch_file_name(file_name) {
                batches.push(BatchFile {
                    index,
                    format,
                    path: relative.join(file_name),
                });
            }
        }
        batches.sort_by_key(|b| b.index);
        Ok(batches)
    }

    /// Find every unit with a complete kind marker in the run directory
    ///
    /// The kind file is the last file shipped for a unit, so its presence
    /// means the unit's definitions arrived.
    pub async fn discover(&self) -> Result<Vec<DiscoveredUnit>> {
        let mut units = Vec::new();
        for (namespace, ns_dir) in list_dirs(&self.root).await? {
            if namespace == ACCESS_CONTROL_DIR {
                if let Some(kind) = read_kind(&ns_dir).await? {
                    units.push(DiscoveredUnit {
                        name: QualifiedName::access_control(),
                        kind,
                    });
                }
                continue;
            }
            if let Some(kind) = read_kind(&ns_dir).await? {
                units.push(DiscoveredUnit {
                    name: QualifiedName::database(&namespace),
                    kind,
                });
            }
            for (object, object_dir) in list_dirs(&ns_dir).await? {
                if let Some(kind) = read_kind(&object_dir).await? {
                    units.push(DiscoveredUnit {
                        name: QualifiedName::new(&namespace, object),
                        kind,
                    });
                }
            }
        }
        units.sort_by(|a, b| {
            (a.kind.phase(), &a.name).cmp(&(b.kind.phase(), &b.name))
        });
        Ok(units)
    }
}

fn batch_file_name(index: u64, format: RowFormat) -> String {
    format!("batch_{:06}.{}.gz", index, format.extension())
}

/// Parse `batch_<n>.<ext>.gz` into its index and format
fn parse_batch_file_name(file_name: &str) -> Option<(u64, RowFormat)> {
    if file_name.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    let stem = file_name.strip_prefix("batch_")?.strip_suffix(".gz")?;
    let (index, ext) = stem.split_once('.')?;
    Some((index.parse().ok()?, RowFormat::from_extension(ext)?))
}

async fn list_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let file_type = entry.file_type().await?;
        if !file_type.is_dir() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            dirs.push((name, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_kind(dir: &Path) -> Result<Option<UnitKind>> {
    let path = dir.join(KIND_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid kind marker {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write a file under its partial name, then rename it into place
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let staging = partial_path(path);
    tokio::fs::write(&staging, contents)
        .await
        .with_context(|| format!("Failed to write {}", staging.display()))?;
    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("Failed to finalize {}", path.display()))
}
