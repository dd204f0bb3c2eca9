//! Warden Common - shared types for the Warden daemon and its GUI
//!
//! Wire protocols (GUI IPC and the engine control channel), the signed
//! update manifest model, core event types, and the daemon configuration.

pub mod config;
pub mod control;
pub mod events;
pub mod ipc;
pub mod manifest;

pub use config::{EngineConfig, SupervisorConfig, UpdateConfig, WardenConfig};
pub use events::{CoreEvent, ProcessState, UpdateStage};
pub use manifest::{current_platform, is_newer_version, UpdateManifest};
