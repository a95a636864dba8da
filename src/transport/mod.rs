// ABOUTME: Transport boundary moving exported files to the destination host
// ABOUTME: Defines the Transport trait plus verified, retried shipping of one file

pub mod local;
pub mod ssh;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{TransportConfig, TransportKind};
use crate::utils;

pub use local::LocalTransport;
pub use ssh::SshTransport;

/// Suffix carried by files that are still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// File copy and remote command execution toward the destination host
///
/// Remote paths are relative to the transport's migration directory.
/// Implementations write to `<path>.partial` and rename once complete, so a
/// file under its final name is always whole.
#[async_trait]
pub trait Transport: Send + Sync {
    fn describe(&self) -> String;

    async fn ensure_remote_dir(&self, path: &Path) -> Result<()>;

    async fn send(&self, local_path: &Path, remote_path: &Path) -> Result<()>;

    /// Size of a remote file, `None` when it does not exist
    async fn remote_size(&self, remote_path: &Path) -> Result<Option<u64>>;

    async fn run_remote_command(&self, host: &str, cmd: &str) -> Result<CommandOutput>;
}

/// Build the configured transport
pub fn from_config(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    Ok(match config.kind {
        TransportKind::Local => Arc::new(LocalTransport::new(&config.path)),
        TransportKind::Ssh => {
            utils::check_required_tools(&["ssh"])?;
            Arc::new(SshTransport::new(config)?)
        }
    })
}

/// Send one file and confirm it arrived whole
///
/// The send is retried with exponential backoff; every attempt is verified
/// by a non-empty local file and a remote size check.
pub async fn ship(
    transport: &dyn Transport,
    local_path: &Path,
    remote_path: &Path,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<u64> {
    let local_size = tokio::fs::metadata(local_path)
        .await
        .with_context(|| format!("Failed to stat {}", local_path.display()))?
        .len();
    if local_size == 0 {
        bail!("Refusing to ship empty file {}", local_path.display());
    }

    utils::retry_with_backoff(
        || async move {
            if let Some(parent) = remote_path.parent() {
                transport.ensure_remote_dir(parent).await?;
            }
            transport.send(local_path, remote_path).await?;
            match transport.remote_size(remote_path).await? {
                Some(size) if size == local_size => Ok(size),
                Some(size) => bail!(
                    "Remote copy of {} has {} bytes, expected {}",
                    remote_path.display(),
                    size,
                    local_size
                ),
                None => bail!(
                    "Remote copy of {} is missing after send",
                    remote_path.display()
                ),
            }
        },
        max_retries,
        initial_delay,
    )
    .await
    .with_context(|| {
        format!(
            "Failed to ship {} via {}",
            local_path.display(),
            transport.describe()
        )
    })
}

/// Path with the in-progress marker appended
pub fn partial_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    name.into()
}
