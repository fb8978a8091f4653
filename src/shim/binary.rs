//! Out-of-process shim binary invocations.
//!
//! A runtime is a shim binary. The daemon runs it with one of two actions:
//!
//! ```text
//! <binary> -namespace <ns> -id <id> -address <daemon> -bundle <path> start
//! <binary> -namespace <ns> -id <id> -address <daemon> -bundle <path> delete
//! ```
//!
//! `start` launches a long-lived shim and prints its bootstrap params.
//! `delete` cleans up after a shim that can no longer be reached and prints
//! the exit of its task as JSON.

use super::BootstrapParams;
use super::bundle::Bundle;
use super::protocol::Exit;
use crate::constants::SHIM_START_TIMEOUT;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

/// The delete half of a shim binary.
///
/// Dead-shim reconciliation only needs this call, which lets tests supply a
/// scripted implementation.
#[async_trait]
pub trait BinaryCall: Send + Sync {
    /// Cleans up after the shim of `(namespace, id)` and reports its exit.
    async fn delete(&self, namespace: &str, id: &str, bundle: &Path) -> Result<Exit>;
}

/// A shim binary on disk.
#[derive(Debug, Clone)]
pub struct ShimBinary {
    path: PathBuf,
    daemon_address: String,
}

impl ShimBinary {
    /// Creates a handle for the binary at `path`. `daemon_address` is passed
    /// to the shim so it can reach the daemon.
    pub fn new(path: impl Into<PathBuf>, daemon_address: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            daemon_address: daemon_address.into(),
        }
    }

    /// Path to the binary.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts the shim of `bundle` and records its bootstrap params in the
    /// bundle's address file.
    pub async fn start(&self, bundle: &Bundle) -> Result<BootstrapParams> {
        let stdout = timeout(
            SHIM_START_TIMEOUT,
            self.run(bundle.namespace(), bundle.id(), bundle.path(), "start"),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("shim start of {}/{}", bundle.namespace(), bundle.id()),
            duration: SHIM_START_TIMEOUT,
        })??;

        let output = String::from_utf8_lossy(&stdout).trim().to_string();
        let params = BootstrapParams::parse(&output)?;
        bundle.write_address(&output)?;

        info!(
            namespace = %bundle.namespace(),
            id = %bundle.id(),
            binary = %self.path.display(),
            address = %params.address,
            "shim started"
        );
        Ok(params)
    }

    async fn run(&self, namespace: &str, id: &str, bundle: &Path, action: &str) -> Result<Vec<u8>> {
        debug!(binary = %self.path.display(), namespace = %namespace, id = %id, action, "running shim binary");

        let mut command = Command::new(&self.path);
        command
            .arg("-namespace")
            .arg(namespace)
            .arg("-id")
            .arg(id)
            .arg("-address")
            .arg(&self.daemon_address)
            .arg("-bundle")
            .arg(bundle)
            .arg(action)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if bundle.is_dir() {
            command.current_dir(bundle);
        }

        let output = command.output().await.map_err(|e| Error::ShimBinary {
            binary: self.path.clone(),
            reason: format!("failed to spawn: {e}"),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ShimBinary {
                binary: self.path.clone(),
                reason: format!("{action} exited with {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl BinaryCall for ShimBinary {
    /// Runs the `delete` action, then removes the bundle directory.
    async fn delete(&self, namespace: &str, id: &str, bundle: &Path) -> Result<Exit> {
        let stdout = self.run(namespace, id, bundle, "delete").await?;
        let exit: Exit = serde_json::from_slice(&stdout)?;

        match std::fs::remove_dir_all(bundle) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        debug!(namespace = %namespace, id = %id, pid = exit.pid, exit_status = exit.exit_status, "shim binary delete finished");
        Ok(exit)
    }
}
