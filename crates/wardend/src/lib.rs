//! Warden Daemon - proxy engine supervisor and secure update pipeline
//!
//! Owns the lifecycle of one external proxy-engine process (spawn,
//! handshake, heartbeat watch, crash recovery with backoff, graceful
//! stop) and the signed-manifest update pipeline (check, verify,
//! fetch, stage, install). The GUI talks to both through the facade,
//! carried over a Unix-socket RPC server.

pub mod control;
pub mod facade;
pub mod probe;
pub mod rpc_server;
pub mod supervisor;
pub mod updater;

pub use facade::AppFacade;
