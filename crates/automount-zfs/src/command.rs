//! Spawns the real `zfs`, `zpool`, and inventory binaries with a timeout and
//! captures what they printed.

use async_trait::async_trait;
use automount_core::error::{AutomountError, AutomountResult};
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Collects stdout, stderr, and exit status from a finished command.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr when present, otherwise stdout.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    /// Turn a non-zero exit into `CommandFailed`.
    pub fn checked(self, binary: &Path, args: &[&str]) -> AutomountResult<Output> {
        if self.success() {
            return Ok(self);
        }
        Err(AutomountError::CommandFailed {
            binary: binary.to_path_buf(),
            args: args.join(" "),
            status: self.status,
            stderr: self.diagnostic().to_string(),
        })
    }
}

/// Runs one external command to completion.
///
/// A non-zero exit is reported through [`Output::status`], not as an error;
/// errors are reserved for failing to launch or timing out.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, binary: &Path, args: &[&str]) -> AutomountResult<Output>;
}

/// [`CommandExecutor`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl CommandExecutor for SystemRunner {
    async fn run(&self, binary: &Path, args: &[&str]) -> AutomountResult<Output> {
        debug!("running {} {}", binary.display(), args.join(" "));
        let child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AutomountError::Launch {
                binary: PathBuf::from(binary),
                source,
            })?;

        let finished = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AutomountError::Timeout {
                binary: binary.to_path_buf(),
                secs: self.timeout.as_secs(),
            })??;

        Ok(Output {
            stdout: String::from_utf8_lossy(&finished.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&finished.stderr).into_owned(),
            status: finished.status.code().unwrap_or(-1),
        })
    }
}
