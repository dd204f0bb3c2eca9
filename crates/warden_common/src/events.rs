//! Core events delivered from the daemon to the GUI
//!
//! Every state transition and update-pipeline stage boundary becomes
//! exactly one event. Events for a given source are delivered in the
//! order they occurred; a fatal condition produces exactly one
//! terminating event with a machine-readable reason code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the proxy engine process slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail")]
pub enum ProcessState {
    /// No engine process exists
    Stopped,
    /// Spawned, waiting for the control-channel handshake
    Starting,
    /// Handshake done, heartbeats flowing
    Running,
    /// Stop-then-start in progress after a config the engine could not hot-reload
    Restarting,
    /// Graceful shutdown in progress
    Stopping,
    /// Engine died unexpectedly; exit code if the OS reported one
    Crashed { code: Option<i32> },
}

impl ProcessState {
    /// True when the slot is free and a new engine may be spawned
    pub fn slot_free(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed { .. })
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed { code: Some(c) } => write!(f, "crashed (exit code {c})"),
            ProcessState::Crashed { code: None } => write!(f, "crashed"),
        }
    }
}

/// Non-terminal stage of an update check, for progress reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStage {
    /// Fetching and verifying the manifest
    Checking,
    /// Streaming the artifact down
    Downloading,
    /// Confirming the artifact hash before staging
    Verifying,
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStage::Checking => write!(f, "checking"),
            UpdateStage::Downloading => write!(f, "downloading"),
            UpdateStage::Verifying => write!(f, "verifying"),
        }
    }
}

/// Event stream from the daemon core to the GUI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CoreEvent {
    /// The engine process slot changed state
    ProcessStateChanged(ProcessState),
    /// Automatic crash recovery gave up after the configured retry budget
    RestartsExhausted { attempts: u32 },
    /// An update check crossed a stage boundary
    UpdateProgress {
        stage: UpdateStage,
        percent: Option<u8>,
    },
    /// The manifest advertises a version newer than the running one
    UpdateAvailable { version: String },
    /// The manifest version is not newer than the running one
    UpdateUpToDate,
    /// A verified artifact is staged and ready to install
    UpdateStaged { version: String },
    /// The check failed; `reason` is a machine-readable code
    UpdateFailed { reason: String },
    /// The check was cancelled by the GUI; any partial download is gone
    UpdateCancelled,
}
