//! App facade: the boundary the GUI programs against
//!
//! Composes the process supervisor and the update coordinator into the
//! command/event contract. Commands delegate; results and progress
//! come back on one broadcast event stream, in occurrence order per
//! source. No command blocks on engine or network latency beyond its
//! own completion.

use crate::probe::LatencyProbe;
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use crate::updater::UpdateCoordinator;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use warden_common::config::WardenConfig;
use warden_common::events::{CoreEvent, ProcessState};

/// Buffer for the GUI event stream; a GUI that stops draining loses
/// the oldest events, not the newest
const EVENT_CAPACITY: usize = 256;

pub struct AppFacade {
    supervisor: ProcessSupervisor,
    updater: Arc<UpdateCoordinator>,
    events: broadcast::Sender<CoreEvent>,
    proxy_addr: String,
}

impl AppFacade {
    pub fn new(config: WardenConfig, current_version: &str) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let proxy_addr = config.engine.proxy_addr.clone();
        let supervisor =
            ProcessSupervisor::spawn(config.engine, config.supervisor, events.clone());
        let updater = Arc::new(UpdateCoordinator::new(
            config.update,
            current_version.to_string(),
            events.clone(),
        )?);

        Ok(Self {
            supervisor,
            updater,
            events,
            proxy_addr,
        })
    }

    /// Subscribe to the core event stream
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub async fn start(&self, config: String) -> Result<(), SupervisorError> {
        self.supervisor.start(config).await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.supervisor.stop().await
    }

    pub async fn apply_config(&self, config: String) -> Result<(), SupervisorError> {
        self.supervisor.apply_config(config).await
    }

    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    /// Kick off an update check; progress and outcome arrive as
    /// events. Calls during an in-flight check coalesce into it.
    pub fn check_update(&self) {
        let updater = Arc::clone(&self.updater);
        tokio::spawn(async move {
            updater.check().await;
        });
    }

    /// Cancel the in-flight update check, if any
    pub fn cancel_update(&self) {
        self.updater.cancel();
    }

    /// Install the staged update artifact
    pub async fn install_staged(&self) -> Result<()> {
        self.updater.install_staged().await
    }

    /// Measure averaged request latency through the engine's proxy
    /// port. Only meaningful against a running engine.
    pub async fn probe_latency(&self, url: &str) -> Result<Duration> {
        if self.supervisor.state() != ProcessState::Running {
            anyhow::bail!("engine is not running");
        }
        let probe = LatencyProbe::new(&self.proxy_addr)?;
        Ok(probe.measure(url).await?)
    }
}
