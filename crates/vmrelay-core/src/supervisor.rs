//! Tunnel client process lifecycle
//!
//! Owns the tunnel client child process as explicit state rather than a bare
//! global. Liveness is checked on the tracked handle (`try_wait`), not on
//! handle presence, so a crashed client is restarted on the next `start`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CoordinatorError;

/// Wait granted to the process between SIGTERM and SIGKILL
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Hot-reload seam between the coordinator and the supervisor
///
/// The coordinator only ever asks the tunnel client to re-read its config;
/// tests substitute a counting fake.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn reload(&self) -> Result<(), CoordinatorError>;
}

/// Manages the tunnel client child process
pub struct TunnelSupervisor {
    executable: PathBuf,
    config_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl TunnelSupervisor {
    pub fn new(executable: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            config_path: config_path.into(),
            child: Mutex::new(None),
        }
    }

    /// Launch the tunnel client unless the tracked process is still alive.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        let mut child = self.child.lock().await;

        if let Some(proc) = child.as_mut() {
            if proc.try_wait()?.is_none() {
                info!("tunnel client is already running");
                return Ok(());
            }
        }

        let spawned = Command::new(&self.executable)
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| {
                CoordinatorError::ExternalTool(format!(
                    "failed to start tunnel client {}: {err}",
                    self.executable.display()
                ))
            })?;

        info!(pid = spawned.id(), "tunnel client started");
        *child = Some(spawned);
        Ok(())
    }

    /// Gracefully terminate the tunnel client, escalating to a forced kill
    /// after a bounded wait.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let mut guard = self.child.lock().await;
        let Some(mut proc) = guard.take() else {
            info!("tunnel client is not running");
            return Ok(());
        };

        if proc.try_wait()?.is_some() {
            info!("tunnel client had already exited");
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = proc.id() {
            // Graceful path first
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(STOP_TIMEOUT, proc.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!("tunnel client did not terminate gracefully, killing it");
                proc.kill().await?;
            }
        }

        info!("tunnel client stopped");
        Ok(())
    }

    /// Whether the tracked child process is currently alive.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(proc) => matches!(proc.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[async_trait]
impl TunnelControl for TunnelSupervisor {
    /// Ask the running tunnel client to re-read its configuration.
    ///
    /// A logged no-op when nothing is running; the config will be picked up
    /// on the next start.
    async fn reload(&self) -> Result<(), CoordinatorError> {
        if !self.is_running().await {
            info!("tunnel client is not running, skipping reload");
            return Ok(());
        }

        let output = Command::new(&self.executable)
            .arg("reload")
            .arg("-c")
            .arg(&self.config_path)
            .output()
            .await
            .map_err(|err| {
                CoordinatorError::ExternalTool(format!("tunnel client reload failed: {err}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoordinatorError::ExternalTool(format!(
                "tunnel client reload exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        debug!("tunnel client configuration reloaded");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write a stub tunnel client that ignores its arguments and sleeps.
    fn stub_client(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("tunnel-client");
        std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("tunnel.toml");
        std::fs::write(&config, "").unwrap();
        let supervisor = TunnelSupervisor::new(stub_client(&dir), config);

        assert!(!supervisor.is_running().await);

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running().await);

        // Second start is a no-op while the process is alive
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running().await);

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("tunnel.toml");
        std::fs::write(&config, "").unwrap();
        let supervisor = TunnelSupervisor::new(stub_client(&dir), config);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reload_without_process_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("tunnel.toml");
        std::fs::write(&config, "").unwrap();
        let supervisor = TunnelSupervisor::new(stub_client(&dir), config);

        supervisor.reload().await.unwrap();
    }
}
