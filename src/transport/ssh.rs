// ABOUTME: Transport over an authenticated SSH channel using the system ssh client
// ABOUTME: Streams uploads to a partial name through a quoted remote shell and renames them

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::{partial_path, CommandOutput, Transport};
use crate::config::TransportConfig;

pub struct SshTransport {
    host: String,
    user: Option<String>,
    port: u16,
    identity_file: Option<PathBuf>,
    root: PathBuf,
}

impl SshTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let host = config
            .host
            .clone()
            .context("transport.host is required for the ssh transport")?;
        Ok(Self {
            host,
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            root: config.path.clone(),
        })
    }

    fn destination(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        }
    }

    fn remote(&self, path: &Path) -> String {
        self.root.join(path).to_string_lossy().into_owned()
    }

    fn ssh(&self, host: &str, cmd: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(identity) = &self.identity_file {
            command.arg("-i").arg(identity);
        }
        command.arg(self.destination(host)).arg(cmd);
        command
    }

    async fn run_checked(&self, cmd: &str) -> Result<String> {
        let output = self.run_remote_command(&self.host, cmd).await?;
        if output.exit_code != 0 {
            bail!(
                "Remote command on {} exited with {}: {}",
                self.host,
                output.exit_code,
                cmd
            );
        }
        Ok(output.stdout)
    }
}

/// Quote a string for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Remote command writing stdin to `path`
fn upload_command(path: &str) -> String {
    format!("cat > {}", shell_quote(path))
}

#[async_trait]
impl Transport for SshTransport {
    fn describe(&self) -> String {
        format!("ssh {}:{}", self.destination(&self.host), self.root.display())
    }

    async fn ensure_remote_dir(&self, path: &Path) -> Result<()> {
        self.run_checked(&format!("mkdir -p {}", shell_quote(&self.remote(path))))
            .await
            .map(|_| ())
    }

    async fn send(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        let target = self.remote(remote_path);
        let staging = partial_path(Path::new(&target))
            .to_string_lossy()
            .into_owned();

        let file = tokio::fs::File::open(local_path)
            .await
            .with_context(|| format!("Failed to open {}", local_path.display()))?
            .into_std()
            .await;
        let output = self
            .ssh(&self.host, &upload_command(&staging))
            .stdin(file)
            .output()
            .await
            .with_context(|| format!("Failed to run ssh to {}", self.host))?;
        if !output.status.success() {
            bail!(
                "Upload of {} to {} failed with {}: {}",
                local_path.display(),
                self.host,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        self.run_checked(&format!(
            "mv -f {} {}",
            shell_quote(&staging),
            shell_quote(&target)
        ))
        .await
        .map(|_| ())
    }

    async fn remote_size(&self, remote_path: &Path) -> Result<Option<u64>> {
        let output = self
            .run_remote_command(
                &self.host,
                &format!("stat -c %s {}", shell_quote(&self.remote(remote_path))),
            )
            .await?;
        if output.exit_code != 0 {
            return Ok(None);
        }
        let size = output
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("Unexpected stat output '{}'", output.stdout.trim()))?;
        Ok(Some(size))
    }

    async fn run_remote_command(&self, host: &str, cmd: &str) -> Result<CommandOutput> {
        let output = self
            .ssh(host, cmd)
            .output()
            .await
            .with_context(|| format!("Failed to run ssh to {}", host))?;

        if !output.status.success() {
            tracing::debug!(
                "ssh {} '{}' stderr: {}",
                host,
                cmd,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
