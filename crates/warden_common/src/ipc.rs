//! IPC protocol between the GUI and the Warden daemon
//!
//! JSON lines over a Unix domain socket. Each request carries a client
//! chosen id echoed back in the response. A `Subscribe` request turns
//! the connection into a one-way event stream.

use crate::events::{CoreEvent, ProcessState};
use serde::{Deserialize, Serialize};

/// Default daemon socket path
pub const SOCKET_PATH: &str = "/run/warden/warden.sock";

/// IPC request from GUI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
}

/// IPC response from daemon to GUI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

/// Request methods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Method {
    /// Start the proxy engine with the given rule configuration
    Start { config: String },

    /// Gracefully stop the proxy engine
    Stop,

    /// Push a new rule configuration; starts the engine if stopped,
    /// hot-reloads if possible, restarts otherwise
    ApplyConfig { config: String },

    /// Get the current engine process state
    GetState,

    /// Kick off an asynchronous update check (results arrive as events)
    CheckUpdate,

    /// Cancel an in-flight update check
    CancelUpdate,

    /// Install the currently staged update artifact
    InstallStaged,

    /// Measure request latency through the running engine's proxy port
    ProbeLatency { url: String },

    /// Switch this connection to event streaming
    Subscribe,

    /// Liveness check
    Ping,
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseData {
    /// Simple success/pong
    Ok,

    /// Current engine process state
    State(ProcessState),

    /// Measured proxied round-trip latency
    Latency { millis: u64 },

    /// A streamed core event (only after `Subscribe`)
    Event(CoreEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_wire_shape() {
        let req = Request {
            id: 3,
            method: Method::ApplyConfig {
                config: "mode: rule".into(),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"ApplyConfig\""));
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 3);
    }
}
