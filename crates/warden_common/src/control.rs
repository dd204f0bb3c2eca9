//! Control channel wire protocol between supervisor and proxy engine
//!
//! Length-prefixed JSON frames (u32 big-endian length, then the frame
//! body) over a local stream socket. Supervisor requests carry an
//! incrementing id and pair with exactly one response matched by that
//! id. The engine also sends unsolicited heartbeat frames; a heartbeat
//! gap beyond the configured timeout is treated as engine death.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body; anything larger is a protocol error
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Command pushed from the supervisor to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum ControlRequest {
    /// Load the configuration file at `path` without restarting
    ApplyConfig { path: String },

    /// Begin graceful shutdown
    Shutdown,

    /// Handshake / liveness probe
    Ping,
}

/// Engine reply to a single control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "detail")]
pub enum ControlReply {
    /// Request acknowledged
    Ok,

    /// Configuration hot-reloaded in place
    Reloaded,

    /// The running engine cannot apply this configuration in place
    CannotReload { reason: String },

    /// Ping answer; carries the engine build identifier
    Pong { engine: String },
}

/// A single frame on the control channel, either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Frame {
    /// Supervisor -> engine
    Request { id: u64, request: ControlRequest },

    /// Engine -> supervisor, exactly one per request id
    Response { id: u64, reply: ControlReply },

    /// Engine -> supervisor, unsolicited periodic liveness signal
    Heartbeat,
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let body = serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body of {} bytes exceeds limit", body.len()),
        ));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Read one length-prefixed frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
