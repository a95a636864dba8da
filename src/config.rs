// ABOUTME: Parses migration configuration files into one immutable config object
// ABOUTME: Converts TOML sections plus CLI overrides into MigrationConfig

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::filters::MigrationFilter;
use crate::switchover::{LagMetric, SwitchoverPolicy};

/// Connection parameters for one ClickHouse HTTP endpoint
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: default_user(),
            password: String::new(),
            timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Local,
    Ssh,
}

/// Where exported files are shipped
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Migration directory on the receiving side
    pub path: PathBuf,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

/// Serializable row format used for batch files
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowFormat {
    Native,
    RowBinaryWithNamesAndTypes,
}

impl RowFormat {
    /// Format name understood by the server
    pub fn as_str(self) -> &'static str {
        match self {
            RowFormat::Native => "Native",
            RowFormat::RowBinaryWithNamesAndTypes => "RowBinaryWithNamesAndTypes",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            RowFormat::Native => "native",
            RowFormat::RowBinaryWithNamesAndTypes => "rowbinary",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "native" => Some(RowFormat::Native),
            "rowbinary" => Some(RowFormat::RowBinaryWithNamesAndTypes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MigrationSection {
    run_dir: PathBuf,
    workers: usize,
    batch_size: u64,
    retry_batch_size: u64,
    batch_delay_ms: u64,
    object_delay_ms: u64,
    max_retries: u32,
    retry_delay_ms: u64,
    format: RowFormat,
    verify_checksums: bool,
    progress: bool,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("migration"),
            workers: 4,
            batch_size: 1_000_000,
            retry_batch_size: 10_000,
            batch_delay_ms: 1_000,
            object_delay_ms: 500,
            max_retries: 3,
            retry_delay_ms: 1_000,
            format: RowFormat::Native,
            verify_checksums: false,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FilterSection {
    include_databases: Option<Vec<String>>,
    exclude_databases: Option<Vec<String>>,
    include_tables: Option<Vec<String>>,
    exclude_tables: Option<Vec<String>>,
    access_control: bool,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            include_databases: None,
            exclude_databases: None,
            include_tables: None,
            exclude_tables: None,
            access_control: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SwitchoverSection {
    metric: LagMetric,
    threshold: u64,
}

impl Default for SwitchoverSection {
    fn default() -> Self {
        Self {
            metric: LagMetric::Seconds,
            threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    source: Option<EndpointConfig>,
    destination: Option<EndpointConfig>,
    transport: Option<TransportConfig>,
    #[serde(default)]
    migration: MigrationSection,
    #[serde(default)]
    filter: FilterSection,
    #[serde(default)]
    switchover: SwitchoverSection,
}

/// CLI flags that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub source: Option<String>,
    pub destination: Option<String>,
    pub run_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub batch_size: Option<u64>,
}

/// Immutable configuration threaded through every component
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: Option<EndpointConfig>,
    pub destination: Option<EndpointConfig>,
    pub transport: Option<TransportConfig>,
    pub run_dir: PathBuf,
    pub workers: usize,
    pub batch_size: u64,
    pub retry_batch_size: u64,
    pub batch_delay: Duration,
    pub object_delay: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub format: RowFormat,
    pub verify_checksums: bool,
    pub progress: bool,
    pub filter: MigrationFilter,
    pub switchover: SwitchoverPolicy,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        let migration = MigrationSection::default();
        let switchover = SwitchoverSection::default();
        Self {
            source: None,
            destination: None,
            transport: None,
            run_dir: migration.run_dir,
            workers: migration.workers,
            batch_size: migration.batch_size,
            retry_batch_size: migration.retry_batch_size,
            batch_delay: Duration::from_millis(migration.batch_delay_ms),
            object_delay: Duration::from_millis(migration.object_delay_ms),
            max_retries: migration.max_retries,
            retry_delay: Duration::from_millis(migration.retry_delay_ms),
            format: migration.format,
            verify_checksums: migration.verify_checksums,
            progress: migration.progress,
            filter: MigrationFilter::empty(),
            switchover: SwitchoverPolicy::new(switchover.metric, switchover.threshold),
        }
    }
}

impl MigrationConfig {
    /// Load configuration from a TOML file (or defaults) and apply overrides
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut file = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).with_context(|| {
                    format!("Failed to read config file at {}", path.display())
                })?;
                toml::from_str::<ConfigFile>(&raw).with_context(|| {
                    format!("Failed to parse TOML config at {}", path.display())
                })?
            }
            None => ConfigFile::default(),
        };

        if let Some(url) = overrides.source {
            file.source = Some(merge_url(file.source, url));
        }
        if let Some(url) = overrides.destination {
            file.destination = Some(merge_url(file.destination, url));
        }
        if let Some(run_dir) = overrides.run_dir {
            file.migration.run_dir = run_dir;
        }
        if let Some(workers) = overrides.workers {
            file.migration.workers = workers;
        }
        if let Some(batch_size) = overrides.batch_size {
            file.migration.batch_size = batch_size;
        }

        let config = Self::from_file_contents(file)?;
        config.validate()?;
        Ok(config)
    }

    fn from_file_contents(file: ConfigFile) -> Result<Self> {
        let filter = MigrationFilter::new(
            file.filter.include_databases,
            file.filter.exclude_databases,
            file.filter.include_tables,
            file.filter.exclude_tables,
            file.filter.access_control,
        )?;

        Ok(Self {
            source: file.source,
            destination: file.destination,
            transport: file.transport,
            run_dir: file.migration.run_dir,
            workers: file.migration.workers,
            batch_size: file.migration.batch_size,
            retry_batch_size: file.migration.retry_batch_size,
            batch_delay: Duration::from_millis(file.migration.batch_delay_ms),
            object_delay: Duration::from_millis(file.migration.object_delay_ms),
            max_retries: file.migration.max_retries,
            retry_delay: Duration::from_millis(file.migration.retry_delay_ms),
            format: file.migration.format,
            verify_checksums: file.migration.verify_checksums,
            progress: file.migration.progress,
            filter,
            switchover: SwitchoverPolicy::new(file.switchover.metric, file.switchover.threshold),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("migration.workers must be at least 1");
        }
        if self.batch_size == 0 || self.retry_batch_size == 0 {
            bail!("migration.batch_size and migration.retry_batch_size must be at least 1");
        }
        if self.retry_batch_size > self.batch_size {
            bail!(
                "migration.retry_batch_size ({}) cannot exceed migration.batch_size ({})",
                self.retry_batch_size,
                self.batch_size
            );
        }
        for endpoint in self.source.iter().chain(self.destination.iter()) {
            crate::utils::validate_endpoint_url(&endpoint.url)?;
        }
        if let (Some(source), Some(destination)) = (&self.source, &self.destination) {
            crate::utils::validate_source_destination_different(&source.url, &destination.url)?;
        }
        if let Some(transport) = &self.transport {
            if transport.kind == TransportKind::Ssh && transport.host.is_none() {
                bail!("transport.host is required for the ssh transport");
            }
        }
        Ok(())
    }

    /// Batch size for a unit that has already failed `attempts` times
    pub fn batch_size_for(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            self.batch_size
        } else {
            self.retry_batch_size
        }
    }

    pub fn require_source(&self) -> Result<&EndpointConfig> {
        self.source
            .as_ref()
            .context("No source endpoint configured (set [source] or pass --source)")
    }

    pub fn require_destination(&self) -> Result<&EndpointConfig> {
        self.destination
            .as_ref()
            .context("No destination endpoint configured (set [destination] or pass --destination)")
    }
}

fn merge_url(existing: Option<EndpointConfig>, url: String) -> EndpointConfig {
    match existing {
        Some(mut endpoint) => {
            endpoint.url = url;
            endpoint
        }
        None => EndpointConfig::new(url),
    }
}

fn default_user() -> String {
    "default".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_ssh_port() -> u16 {
    22
}
