//! Proxy engine process supervisor
//!
//! Owns the single engine process slot. All lifecycle requests (start,
//! apply-config, stop) flow through one mpsc queue into one owner
//! task, so transitions are serialized and executed strictly FIFO: a
//! request arriving mid-transition waits, it is never dropped or
//! reordered. Crash recovery is driven by explicit timed transitions
//! (a restart deadline armed per process generation), not recursive
//! retries, and stops after the configured attempt budget.
//!
//! State-change events are emitted in the exact order transitions
//! occur, on both a watch channel (current state) and the shared
//! broadcast event stream.

pub mod backoff;
pub mod launcher;

pub use backoff::{BackoffConfig, BackoffState};
pub use launcher::{EngineLauncher, EngineProcess, SpawnError};

use crate::control::{ChannelHealth, ControlChannel, ControlError};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use warden_common::config::{EngineConfig, SupervisorConfig};
use warden_common::control::{ControlReply, ControlRequest};
use warden_common::events::{CoreEvent, ProcessState};

/// Delay between control-socket connect attempts during the handshake
const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error("{0}")]
    Spawn(String),

    #[error("engine handshake timed out")]
    HandshakeTimeout,

    #[error("control channel failed; engine is being restarted")]
    ControlFailed,

    #[error("supervisor task is gone")]
    Closed,
}

enum Command {
    Start {
        config: String,
        done: oneshot::Sender<Result<(), SupervisorError>>,
    },
    ApplyConfig {
        config: String,
        done: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        done: oneshot::Sender<Result<(), SupervisorError>>,
    },
}

/// Signals from monitor tasks back into the owner loop, tagged with
/// the process generation they belong to so stragglers from a torn
/// down engine are ignored.
enum Internal {
    Exited { generation: u64, code: Option<i32> },
    ChannelDead { generation: u64, reason: String },
    RestartDue { generation: u64 },
}

/// Handle to the supervisor owner task
#[derive(Clone)]
pub struct ProcessSupervisor {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ProcessState>,
}

impl ProcessSupervisor {
    /// Spawn the owner task. Events go to the shared broadcast stream.
    pub fn spawn(
        engine_cfg: EngineConfig,
        sup_cfg: SupervisorConfig,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ProcessState::Stopped);

        let launcher = EngineLauncher::new(engine_cfg.binaries.clone());
        let backoff = BackoffState::new(BackoffConfig {
            base: Duration::from_millis(sup_cfg.backoff_base_ms),
            cap: Duration::from_millis(sup_cfg.backoff_cap_ms),
            ..BackoffConfig::default()
        });

        let task = SupervisorTask {
            engine_cfg,
            sup_cfg,
            launcher,
            state: ProcessState::Stopped,
            state_tx,
            events,
            internal_tx,
            running: None,
            generation: 0,
            backoff,
            restarts_used: 0,
            last_config: None,
        };
        tokio::spawn(task.run(cmd_rx, internal_rx));

        Self { cmd_tx, state_rx }
    }

    pub async fn start(&self, config: String) -> Result<(), SupervisorError> {
        self.send(|done| Command::Start { config, done }).await
    }

    pub async fn apply_config(&self, config: String) -> Result<(), SupervisorError> {
        self.send(|done| Command::ApplyConfig { config, done }).await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.send(|done| Command::Stop { done }).await
    }

    /// Current state snapshot
    pub fn state(&self) -> ProcessState {
        self.state_rx.borrow().clone()
    }

    /// Watch state changes in transition order
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    async fn send<F>(&self, make: F) -> Result<(), SupervisorError>
    where
        F: FnOnce(oneshot::Sender<Result<(), SupervisorError>>) -> Command,
    {
        let (done, ack) = oneshot::channel();
        self.cmd_tx
            .send(make(done))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        ack.await.map_err(|_| SupervisorError::Closed)?
    }
}

/// The live engine slot: control channel plus a kill line into the
/// monitor task that owns the OS process.
struct RunningEngine {
    channel: ControlChannel,
    kill_tx: Option<oneshot::Sender<()>>,
    generation: u64,
}

struct SupervisorTask {
    engine_cfg: EngineConfig,
    sup_cfg: SupervisorConfig,
    launcher: EngineLauncher,
    state: ProcessState,
    state_tx: watch::Sender<ProcessState>,
    events: broadcast::Sender<CoreEvent>,
    internal_tx: mpsc::Sender<Internal>,
    running: Option<RunningEngine>,
    /// Bumped on every spawn and every teardown; internals carrying an
    /// older generation are stale and dropped
    generation: u64,
    backoff: BackoffState,
    restarts_used: u32,
    /// Preserved across crash restarts and queued restarts
    last_config: Option<String>,
}

impl SupervisorTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut internal_rx).await,
                    None => {
                        // Every handle dropped; take the engine down with us
                        if self.running.is_some() {
                            self.stop_engine(&mut internal_rx).await;
                        }
                        return;
                    }
                },
                Some(ev) = internal_rx.recv() => self.handle_internal(ev).await,
            }
        }
    }

    fn set_state(&mut self, next: ProcessState) {
        info!("engine state: {} -> {}", self.state, next);
        self.state = next.clone();
        let _ = self.state_tx.send(next.clone());
        let _ = self.events.send(CoreEvent::ProcessStateChanged(next));
    }

    async fn handle_command(&mut self, cmd: Command, internal_rx: &mut mpsc::Receiver<Internal>) {
        match cmd {
            Command::Start { config, done } => {
                let result = if self.state.slot_free() {
                    self.reset_recovery();
                    self.do_start(config).await
                } else {
                    Err(SupervisorError::AlreadyRunning)
                };
                let _ = done.send(result);
            }
            Command::ApplyConfig { config, done } => {
                let result = self.do_apply_config(config, internal_rx).await;
                let _ = done.send(result);
            }
            Command::Stop { done } => {
                self.reset_recovery();
                if self.state.slot_free() {
                    // Nothing to stop; cancel any pending crash restart
                    self.generation += 1;
                    if self.state != ProcessState::Stopped {
                        self.set_state(ProcessState::Stopped);
                    }
                } else {
                    self.set_state(ProcessState::Stopping);
                    self.stop_engine(internal_rx).await;
                    self.set_state(ProcessState::Stopped);
                }
                let _ = done.send(Ok(()));
            }
        }
    }

    async fn handle_internal(&mut self, ev: Internal) {
        match ev {
            Internal::Exited { generation, code } => {
                if generation != self.generation {
                    return;
                }
                warn!("engine exited unexpectedly (code {code:?})");
                self.running = None;
                self.generation += 1;
                self.set_state(ProcessState::Crashed { code });
                self.schedule_restart();
            }
            Internal::ChannelDead { generation, reason } => {
                if generation != self.generation {
                    return;
                }
                // The OS process may still be alive but unresponsive;
                // a dead control channel counts as a crash either way
                warn!("control channel lost: {reason}");
                if let Some(mut running) = self.running.take() {
                    if let Some(kill) = running.kill_tx.take() {
                        let _ = kill.send(());
                    }
                }
                self.generation += 1;
                self.set_state(ProcessState::Crashed { code: None });
                self.schedule_restart();
            }
            Internal::RestartDue { generation } => {
                if generation != self.generation {
                    return;
                }
                let config = match self.last_config.clone() {
                    Some(c) => c,
                    None => return,
                };
                info!(
                    "attempting automatic restart {}/{}",
                    self.restarts_used, self.sup_cfg.max_restarts
                );
                if let Err(e) = self.do_start(config).await {
                    warn!("automatic restart failed: {e}");
                }
            }
        }
    }

    /// Queue the next automatic restart, or give up once the budget is
    /// spent. The armed deadline is keyed to the current generation so
    /// an explicit start or stop cancels it.
    fn schedule_restart(&mut self) {
        if self.restarts_used >= self.sup_cfg.max_restarts {
            error!(
                "engine crashed {} times; giving up automatic recovery",
                self.restarts_used
            );
            let _ = self.events.send(CoreEvent::RestartsExhausted {
                attempts: self.restarts_used,
            });
            return;
        }
        self.restarts_used += 1;
        let delay = self.backoff.next_backoff();
        info!("scheduling restart attempt {} in {delay:?}", self.restarts_used);

        let generation = self.generation;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RestartDue { generation }).await;
        });
    }

    fn reset_recovery(&mut self) {
        self.restarts_used = 0;
        self.backoff.reset();
    }

    async fn do_apply_config(
        &mut self,
        config: String,
        internal_rx: &mut mpsc::Receiver<Internal>,
    ) -> Result<(), SupervisorError> {
        if self.state.slot_free() {
            self.reset_recovery();
            return self.do_start(config).await;
        }

        // Hot reload first; only fall back to a restart if the engine
        // says it cannot apply this config in place
        let path = self.write_engine_config(&config).await?;
        self.last_config = Some(config.clone());

        let running = match &self.running {
            Some(r) => r,
            None => return self.do_start(config).await,
        };
        let reply = running
            .channel
            .request_with_retry(
                ControlRequest::ApplyConfig {
                    path: path.display().to_string(),
                },
                self.sup_cfg.handshake_timeout(),
            )
            .await;

        match reply {
            Ok(ControlReply::Reloaded) | Ok(ControlReply::Ok) => {
                info!("engine hot-reloaded configuration");
                Ok(())
            }
            Ok(ControlReply::CannotReload { reason }) => {
                info!("engine cannot hot-reload ({reason}); restarting");
                self.do_restart(config, internal_rx).await
            }
            Ok(other) => {
                warn!("unexpected reply to config push: {other:?}");
                self.do_restart(config, internal_rx).await
            }
            Err(e) => {
                // Already retried once inside the channel; treat as crash
                warn!("config push failed twice ({e}); treating engine as crashed");
                if let Some(mut running) = self.running.take() {
                    if let Some(kill) = running.kill_tx.take() {
                        let _ = kill.send(());
                    }
                }
                self.generation += 1;
                self.set_state(ProcessState::Crashed { code: None });
                self.schedule_restart();
                Err(SupervisorError::ControlFailed)
            }
        }
    }

    /// Stop-then-start while presenting a single Restarting state
    async fn do_restart(
        &mut self,
        config: String,
        internal_rx: &mut mpsc::Receiver<Internal>,
    ) -> Result<(), SupervisorError> {
        self.set_state(ProcessState::Restarting);
        self.stop_engine(internal_rx).await;
        self.reset_recovery();
        self.do_start(config).await
    }

    async fn do_start(&mut self, config: String) -> Result<(), SupervisorError> {
        // Invalidate any restart timer still pending from the previous
        // incarnation; if this start fails with a spawn error it must
        // stay failed
        self.generation += 1;
        self.set_state(ProcessState::Starting);
        self.last_config = Some(config.clone());

        let config_path = match self.write_engine_config(&config).await {
            Ok(p) => p,
            Err(e) => {
                self.set_state(ProcessState::Crashed { code: None });
                return Err(e);
            }
        };

        // The engine binds this socket; clear any stale one first
        let socket = self.engine_cfg.control_socket.clone();
        let _ = tokio::fs::remove_file(&socket).await;

        let process = match self.launcher.spawn(&config_path, &socket).await {
            Ok(p) => p,
            Err(e) => {
                // Spawn errors are fatal: surfaced once, never retried
                error!("engine spawn failed: {e}");
                self.set_state(ProcessState::Crashed { code: None });
                return Err(SupervisorError::Spawn(e.to_string()));
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor_engine(
            process,
            generation,
            kill_rx,
            self.internal_tx.clone(),
        ));

        match self.handshake(&socket).await {
            Ok(channel) => {
                spawn_health_watcher(channel.health(), generation, self.internal_tx.clone());
                self.running = Some(RunningEngine {
                    channel,
                    kill_tx: Some(kill_tx),
                    generation,
                });
                // The recovery budget survives a successful automatic
                // restart; only an explicit start or stop resets it,
                // so a crash loop cannot restart forever
                self.set_state(ProcessState::Running);
                Ok(())
            }
            Err(e) => {
                warn!("engine handshake failed: {e}");
                let _ = kill_tx.send(());
                self.generation += 1;
                self.set_state(ProcessState::Crashed { code: None });
                // Handshake timeouts are crashes: retried per backoff
                self.schedule_restart();
                Err(e)
            }
        }
    }

    /// Connect and complete the first ping round trip within the
    /// handshake budget. A wedged engine that accepts connections but
    /// never answers still times out here.
    async fn handshake(&self, socket: &PathBuf) -> Result<ControlChannel, SupervisorError> {
        let deadline = Instant::now() + self.sup_cfg.handshake_timeout();
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if d > Duration::ZERO => d,
                _ => return Err(SupervisorError::HandshakeTimeout),
            };

            match ControlChannel::connect(socket, self.sup_cfg.heartbeat_timeout()).await {
                Ok(channel) => match channel.request(ControlRequest::Ping, remaining).await {
                    Ok(ControlReply::Pong { engine }) => {
                        info!("engine handshake complete ({engine})");
                        return Ok(channel);
                    }
                    Ok(other) => {
                        debug!("unexpected handshake reply: {other:?}");
                        return Ok(channel);
                    }
                    Err(ControlError::Timeout(_)) => return Err(SupervisorError::HandshakeTimeout),
                    Err(e) => {
                        debug!("handshake attempt failed: {e}");
                        tokio::time::sleep(HANDSHAKE_POLL).await;
                    }
                },
                Err(e) => {
                    debug!("control socket not ready: {e}");
                    tokio::time::sleep(HANDSHAKE_POLL).await;
                }
            }
        }
    }

    /// Graceful shutdown: ask over the control channel, wait out the
    /// grace period, then kill. Returns once the process is reaped.
    async fn stop_engine(&mut self, internal_rx: &mut mpsc::Receiver<Internal>) {
        let Some(mut running) = self.running.take() else {
            self.generation += 1;
            return;
        };
        let generation = running.generation;

        // One grace budget covers the shutdown request and the wait
        // for exit together; an engine that never answers is killed
        // after a single grace period, not two
        let deadline = tokio::time::Instant::now() + self.sup_cfg.grace_period();
        let graceful = running
            .channel
            .request(ControlRequest::Shutdown, self.sup_cfg.grace_period())
            .await;
        if let Err(e) = &graceful {
            debug!("graceful shutdown request failed: {e}");
        }

        let grace = tokio::time::sleep_until(deadline);
        tokio::pin!(grace);
        let mut killed = false;
        loop {
            tokio::select! {
                ev = internal_rx.recv() => match ev {
                    Some(Internal::Exited { generation: g, code }) if g == generation => {
                        debug!("engine exited during stop (code {code:?})");
                        break;
                    }
                    Some(_) => {} // stale generations and timers
                    None => break,
                },
                _ = &mut grace, if !killed => {
                    warn!("engine ignored graceful shutdown; killing");
                    if let Some(kill) = running.kill_tx.take() {
                        let _ = kill.send(());
                    }
                    killed = true;
                }
            }
        }

        self.generation += 1;
    }

    async fn write_engine_config(&self, config: &str) -> Result<PathBuf, SupervisorError> {
        let dir = &self.engine_cfg.config_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SupervisorError::Spawn(format!("cannot create {}: {e}", dir.display())))?;
        let path = dir.join("engine.json");
        tokio::fs::write(&path, config)
            .await
            .map_err(|e| SupervisorError::Spawn(format!("cannot write {}: {e}", path.display())))?;
        Ok(path)
    }
}

/// Owns the OS process: waits for exit or a kill order, then reports
/// exactly one Exited for its generation.
async fn monitor_engine(
    mut process: EngineProcess,
    generation: u64,
    kill_rx: oneshot::Receiver<()>,
    internal_tx: mpsc::Sender<Internal>,
) {
    let code = tokio::select! {
        code = process.wait() => code,
        _ = kill_rx => {
            process.kill().await;
            process.wait().await
        }
    };
    let _ = internal_tx.send(Internal::Exited { generation, code }).await;
}

/// Translates a dead control channel into a supervisor signal
fn spawn_health_watcher(
    mut health: watch::Receiver<ChannelHealth>,
    generation: u64,
    internal_tx: mpsc::Sender<Internal>,
) {
    tokio::spawn(async move {
        while health.changed().await.is_ok() {
            let dead = match &*health.borrow() {
                ChannelHealth::Dead { reason } => Some(reason.clone()),
                ChannelHealth::Alive => None,
            };
            if let Some(reason) = dead {
                let _ = internal_tx
                    .send(Internal::ChannelDead { generation, reason })
                    .await;
                return;
            }
        }
    });
}
