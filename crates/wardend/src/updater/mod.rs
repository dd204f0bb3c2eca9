//! Update coordinator
//!
//! Orchestrates one update check end to end: manifest fetch from the
//! ordered endpoint list, signature verification, fail-closed version
//! comparison, artifact download, staging. Progress is reported as
//! events at every stage boundary; every terminal outcome is exactly
//! one event. A check already in flight absorbs new check requests
//! instead of running a second pipeline, and cancellation aborts the
//! active transfer without leaving a partial file behind.

pub mod fetch;
pub mod verify;

pub use fetch::{Artifact, ArtifactFetcher, FetchError};
pub use verify::{verify, SignaturePublicKey, VerifyError};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempPath;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};
use warden_common::config::UpdateConfig;
use warden_common::events::{CoreEvent, UpdateStage};
use warden_common::manifest::{current_platform, is_newer_version};

/// A verified artifact staged for installation. Consumed exactly once
/// by the install step; the backing temp file is deleted when this is
/// dropped, whatever the outcome.
pub struct StagedUpdate {
    pub version: String,
    pub sha256: String,
    path: TempPath,
}

impl StagedUpdate {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

enum CheckOutcome {
    UpToDate,
    Staged { version: String },
}

/// Drives the check -> verify -> fetch -> stage pipeline
pub struct UpdateCoordinator {
    config: UpdateConfig,
    key: SignaturePublicKey,
    fetcher: ArtifactFetcher,
    current_version: String,
    events: broadcast::Sender<CoreEvent>,
    checking: AtomicBool,
    cancel: Notify,
    staged: Mutex<Option<StagedUpdate>>,
}

impl UpdateCoordinator {
    pub fn new(
        config: UpdateConfig,
        current_version: String,
        events: broadcast::Sender<CoreEvent>,
    ) -> Result<Self> {
        let key = SignaturePublicKey::from_hex(&config.public_key)
            .context("invalid update public key in config")?;
        let fetcher = ArtifactFetcher::new(Duration::from_secs(config.http_timeout_secs));
        Ok(Self {
            config,
            key,
            fetcher,
            current_version,
            events,
            checking: AtomicBool::new(false),
            cancel: Notify::new(),
            staged: Mutex::new(None),
        })
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    /// Run one update check. A concurrent call while a check is in
    /// flight coalesces into it and returns immediately; the caller
    /// observes the in-flight check's events.
    pub async fn check(&self) {
        // Register for cancellation before publishing the in-flight
        // flag; a cancel racing the start of the check would otherwise
        // fall between the two and be lost
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        if self.checking.swap(true, Ordering::SeqCst) {
            debug!("update check already in flight; coalescing");
            return;
        }

        let outcome = tokio::select! {
            _ = &mut cancelled => None,
            result = self.run_check() => Some(result),
        };

        match outcome {
            // Dropping the pipeline future dropped any partial temp file
            None => {
                info!("update check cancelled");
                self.emit(CoreEvent::UpdateCancelled);
            }
            Some(Ok(CheckOutcome::UpToDate)) => {
                info!("already up to date (version {})", self.current_version);
                self.emit(CoreEvent::UpdateUpToDate);
            }
            Some(Ok(CheckOutcome::Staged { version })) => {
                info!("update {version} staged");
                self.emit(CoreEvent::UpdateStaged { version });
            }
            Some(Err(reason)) => {
                warn!("update check failed: {reason}");
                self.emit(CoreEvent::UpdateFailed { reason });
            }
        }

        self.checking.store(false, Ordering::SeqCst);
    }

    /// Cancel the in-flight check, if any
    pub fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    /// The pipeline proper; errors are machine-readable reason codes
    async fn run_check(&self) -> Result<CheckOutcome, String> {
        self.emit(CoreEvent::UpdateProgress {
            stage: UpdateStage::Checking,
            percent: None,
        });

        let manifest_bytes = self
            .fetcher
            .fetch_manifest_bytes(&self.config.endpoints)
            .await
            .map_err(|_| "manifest-unreachable".to_string())?;

        // Nothing downstream happens on an unverified manifest
        let manifest = verify(&manifest_bytes, &self.key).map_err(|e| match e {
            VerifyError::Malformed(_) => "manifest-malformed".to_string(),
            VerifyError::BadSignature => "signature-invalid".to_string(),
        })?;

        if !is_newer_version(&manifest.version, &self.current_version) {
            return Ok(CheckOutcome::UpToDate);
        }

        self.emit(CoreEvent::UpdateAvailable {
            version: manifest.version.clone(),
        });

        let platform = current_platform();
        let url = manifest
            .artifact_url(&platform)
            .ok_or_else(|| "no-platform-artifact".to_string())?
            .to_string();

        self.emit(CoreEvent::UpdateProgress {
            stage: UpdateStage::Downloading,
            percent: Some(0),
        });
        let artifact = self
            .fetcher
            .fetch(
                std::slice::from_ref(&url),
                &manifest.sha256,
                &self.config.staging_dir,
                |percent| {
                    let _ = self.events.send(CoreEvent::UpdateProgress {
                        stage: UpdateStage::Downloading,
                        percent: Some(percent),
                    });
                },
            )
            .await
            .map_err(|_| "artifact-unreachable".to_string())?;

        self.emit(CoreEvent::UpdateProgress {
            stage: UpdateStage::Verifying,
            percent: None,
        });

        let staged = StagedUpdate {
            version: manifest.version.clone(),
            sha256: artifact.sha256,
            path: artifact.file.into_temp_path(),
        };
        *self.staged.lock().await = Some(staged);

        Ok(CheckOutcome::Staged {
            version: manifest.version,
        })
    }

    /// Version of the currently staged update, if one is waiting
    pub async fn staged_version(&self) -> Option<String> {
        self.staged.lock().await.as_ref().map(|s| s.version.clone())
    }

    /// Install the staged artifact over the configured binary. The
    /// staged file is consumed and deleted regardless of outcome.
    pub async fn install_staged(&self) -> Result<()> {
        let staged = self
            .staged
            .lock()
            .await
            .take()
            .context("no staged update to install")?;

        let result = self.install(&staged);
        drop(staged);
        result
    }

    fn install(&self, staged: &StagedUpdate) -> Result<()> {
        // Guard against the staged file changing between staging and
        // install
        let data = fs::read(staged.path()).context("failed to read staged artifact")?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let got = hex::encode(hasher.finalize());
        if !got.eq_ignore_ascii_case(&staged.sha256) {
            anyhow::bail!("staged artifact hash changed: expected {}, got {got}", staged.sha256);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o755))
                .context("failed to mark staged artifact executable")?;
        }

        info!(
            "installing update {} to {}",
            staged.version,
            self.config.install_path.display()
        );
        atomic_replace(&self.config.install_path, staged.path())
    }
}

/// Atomic file replacement with backup restore on failure
fn atomic_replace(target: &Path, source: &Path) -> Result<()> {
    let backup: PathBuf = target.with_extension("bak");

    if target.exists() {
        fs::copy(target, &backup).context("failed to create backup")?;
    }

    match fs::rename(source, target) {
        Ok(()) => {
            let _ = fs::remove_file(&backup);
            Ok(())
        }
        Err(e) => {
            warn!("replace failed, restoring backup: {e}");
            if backup.exists() {
                let _ = fs::rename(&backup, target);
            }
            Err(e).context("atomic replace failed")
        }
    }
}
