//! Daemon configuration
//!
//! Loaded once from a TOML file at startup and treated as immutable
//! process-wide state afterwards: the update endpoint list and the
//! signature public key are never mutated at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const CONFIG_PATH: &str = "/etc/warden/warden.toml";

/// Embedded release signing key (hex ed25519). Manifests must verify
/// against this unless the config overrides it.
pub const RELEASE_PUBLIC_KEY: &str =
    "5866666666666666666666666666666666666666666666666666666666666666";

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub engine: EngineConfig,
    pub supervisor: SupervisorConfig,
    pub update: UpdateConfig,
}

/// Which engine binary to run and where its control surface lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candidate engine binaries, tried in order; the first one that
    /// exists is spawned. Two interchangeable engine builds are the
    /// common case.
    pub binaries: Vec<PathBuf>,

    /// Unix socket the engine binds its control channel to
    pub control_socket: PathBuf,

    /// Directory the generated rule-config file is written into
    pub config_dir: PathBuf,

    /// Local address of the engine's inbound proxy port; latency
    /// probes route through it
    pub proxy_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binaries: vec![
                PathBuf::from("/usr/local/bin/warden-engine"),
                PathBuf::from("/usr/local/bin/warden-engine-alt"),
            ],
            control_socket: PathBuf::from("/run/warden/engine.sock"),
            config_dir: PathBuf::from("/run/warden"),
            proxy_addr: "127.0.0.1:7890".to_string(),
        }
    }
}

/// Supervision timeouts and the crash-recovery budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time allowed between spawn and a successful control handshake
    pub handshake_timeout_ms: u64,

    /// Time allowed for graceful shutdown before SIGKILL
    pub grace_period_ms: u64,

    /// Heartbeat gap treated as engine death
    pub heartbeat_timeout_ms: u64,

    /// Automatic restart attempts after a crash before giving up
    pub max_restarts: u32,

    /// First restart delay; doubles each attempt
    pub backoff_base_ms: u64,

    /// Ceiling on the restart delay
    pub backoff_cap_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            grace_period_ms: 5_000,
            heartbeat_timeout_ms: 5_000,
            max_restarts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl SupervisorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Update pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Manifest source URLs, tried strictly in order; the mirror set
    /// is configurable rather than a fixed primary-plus-mirror pair.
    pub endpoints: Vec<String>,

    /// Hex-encoded ed25519 public key manifests must be signed with
    pub public_key: String,

    /// Binary the staged artifact replaces on install
    pub install_path: PathBuf,

    /// Directory partial downloads are staged in
    pub staging_dir: PathBuf,

    /// Per-request HTTP timeout
    pub http_timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://github.com/warden-app/warden/releases/latest/download/manifest.json"
                    .to_string(),
                "https://mirror.warden-app.org/manifest.json".to_string(),
            ],
            public_key: RELEASE_PUBLIC_KEY.to_string(),
            install_path: PathBuf::from("/usr/local/bin/warden-app"),
            staging_dir: std::env::temp_dir(),
            http_timeout_secs: 30,
        }
    }
}

impl WardenConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = WardenConfig::default();
        assert_eq!(cfg.supervisor.max_restarts, 3);
        assert_eq!(cfg.supervisor.handshake_timeout(), Duration::from_secs(5));
        assert!(cfg.update.endpoints.len() >= 2);
        assert!(!cfg.engine.binaries.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: WardenConfig = toml::from_str(
            r#"
            [update]
            endpoints = ["https://one.example/manifest.json"]
            public_key = "00ff"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.update.endpoints.len(), 1);
        assert_eq!(cfg.update.public_key, "00ff");
        // Untouched sections keep their defaults
        assert_eq!(cfg.supervisor.backoff_cap_ms, 30_000);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = WardenConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }
}
