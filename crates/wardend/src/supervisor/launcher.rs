//! Engine process spawning
//!
//! Picks the first available engine binary of the configured variants
//! and spawns it with the generated config path and control-socket
//! address as arguments. Engine output lines are forwarded to the log
//! at debug level; the rule-config contents are never interpreted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Spawn failures are fatal: surfaced once, never retried
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no engine binary found (tried {0:?})")]
    NoBinary(Vec<PathBuf>),

    #[error("failed to spawn {binary}: {source}")]
    Io {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Spawns engine processes from a fixed list of candidate binaries
#[derive(Debug, Clone)]
pub struct EngineLauncher {
    binaries: Vec<PathBuf>,
}

impl EngineLauncher {
    pub fn new(binaries: Vec<PathBuf>) -> Self {
        Self { binaries }
    }

    /// First candidate binary that exists on disk
    fn resolve(&self) -> Result<&Path, SpawnError> {
        self.binaries
            .iter()
            .find(|p| p.is_file())
            .map(PathBuf::as_path)
            .ok_or_else(|| SpawnError::NoBinary(self.binaries.clone()))
    }

    pub async fn spawn(
        &self,
        config_path: &Path,
        control_socket: &Path,
    ) -> Result<EngineProcess, SpawnError> {
        let binary = self.resolve()?.to_path_buf();

        let mut child = Command::new(&binary)
            .arg("--config")
            .arg(config_path)
            .arg("--control")
            .arg(control_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Io {
                binary: binary.clone(),
                source,
            })?;

        let pid = child.id();
        info!("spawned engine {} (pid {:?})", binary.display(), pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        Ok(EngineProcess {
            child,
            binary,
            pid,
            spawned_at: Instant::now(),
        })
    }
}

/// Forward engine output to the daemon log
async fn forward_output<R>(stream: R, name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("engine {name}: {line}");
    }
}

/// A live engine process. Exactly one exists per supervisor slot; it
/// is destroyed when the slot reaches Stopped or Crashed.
pub struct EngineProcess {
    child: Child,
    binary: PathBuf,
    pid: Option<u32>,
    spawned_at: Instant,
}

impl EngineProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.spawned_at.elapsed()
    }

    /// Wait for the process to exit; returns the exit code if the OS
    /// reported one (signal death reports none)
    pub async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("wait on engine pid {:?} failed: {e}", self.pid);
                None
            }
        }
    }

    /// Forcibly terminate the process and reap it
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            // Already-exited processes land here; nothing to do
            debug!("kill engine pid {:?}: {e}", self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_first_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let present = dir.path().join("present");
        std::fs::write(&present, b"#!/bin/sh\n").unwrap();

        let launcher = EngineLauncher::new(vec![missing, present.clone()]);
        assert_eq!(launcher.resolve().unwrap(), present.as_path());
    }

    #[test]
    fn test_resolve_reports_all_candidates() {
        let launcher = EngineLauncher::new(vec![PathBuf::from("/nonexistent/engine")]);
        match launcher.resolve() {
            Err(SpawnError::NoBinary(tried)) => assert_eq!(tried.len(), 1),
            other => panic!("expected NoBinary, got {other:?}"),
        }
    }
}
