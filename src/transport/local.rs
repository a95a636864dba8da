// ABOUTME: Transport into a directory on the local filesystem
// ABOUTME: Used for shared mounts and same-host migrations

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{partial_path, CommandOutput, Transport};

pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        format!("local directory {}", self.root.display())
    }

    async fn ensure_remote_dir(&self, path: &Path) -> Result<()> {
        let dir = self.resolve(path);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))
    }

    async fn send(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        let target = self.resolve(remote_path);
        let staging = partial_path(&target);
        tokio::fs::copy(local_path, &staging).await.with_context(|| {
            format!(
                "Failed to copy {} to {}",
                local_path.display(),
                staging.display()
            )
        })?;
        tokio::fs::rename(&staging, &target)
            .await
            .with_context(|| format!("Failed to finalize {}", target.display()))
    }

    async fn remote_size(&self, remote_path: &Path) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.resolve(remote_path)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", remote_path.display())),
        }
    }

    async fn run_remote_command(&self, host: &str, cmd: &str) -> Result<CommandOutput> {
        tracing::debug!("Running '{}' locally on behalf of {}", cmd, host);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.root)
            .output()
            .await
            .with_context(|| format!("Failed to run '{}'", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_remote_size_of_missing_file() {
        let dir = tempdir().unwrap();
        let transport = LocalTransport::new(dir.path());
        assert_eq!(
            transport.remote_size(Path::new("nope.gz")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_run_remote_command_reports_exit_code() {
        let dir = tempdir().unwrap();
        let transport = LocalTransport::new(dir.path());

        let ok = transport.run_remote_command("localhost", "echo ready").await.unwrap();
        assert_eq!(ok.stdout.trim(), "ready");
        assert_eq!(ok.exit_code, 0);

        let failed = transport.run_remote_command("localhost", "exit 3").await.unwrap();
        assert_eq!(failed.exit_code, 3);
    }
}
