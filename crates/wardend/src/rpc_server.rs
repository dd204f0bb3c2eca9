//! RPC Server - Unix socket server for GUI-daemon communication
//!
//! JSON lines, one request per line, one response per request. A
//! `Subscribe` request flips the connection into a one-way event
//! stream carrying the core event feed until the client disconnects.

use crate::facade::AppFacade;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};
use warden_common::ipc::{Method, Request, Response, ResponseData};

/// Start the RPC server on the given socket path
pub async fn start_server(socket_path: &Path, facade: Arc<AppFacade>) -> Result<()> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("failed to create socket directory")?;
    }

    // Remove old socket if it exists
    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;
    info!("RPC server listening on {}", socket_path.display());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    }

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let facade = Arc::clone(&facade);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, facade).await {
                        error!("connection handler error: {e}");
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {e}");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, facade: Arc<AppFacade>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("failed to read from socket")?;
        if bytes_read == 0 {
            break;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("invalid request JSON: {e}");
                continue;
            }
        };

        if matches!(request.method, Method::Subscribe) {
            let response = Response {
                id: request.id,
                result: Ok(ResponseData::Ok),
            };
            write_response(&mut writer, &response).await?;
            return stream_events(writer, facade).await;
        }

        let response = handle_request(request.id, request.method, &facade).await;
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Forward core events to this client until it goes away
async fn stream_events(
    mut writer: tokio::net::unix::OwnedWriteHalf,
    facade: Arc<AppFacade>,
) -> Result<()> {
    let mut events = facade.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let response = Response {
                    id: 0,
                    result: Ok(ResponseData::Event(event)),
                };
                if write_response(&mut writer, &response).await.is_err() {
                    debug!("event subscriber disconnected");
                    return Ok(());
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!("event subscriber lagged; dropped {missed} events");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<()> {
    let json = serde_json::to_string(response)? + "\n";
    writer
        .write_all(json.as_bytes())
        .await
        .context("failed to write response")
}

async fn handle_request(id: u64, method: Method, facade: &AppFacade) -> Response {
    let result = match method {
        Method::Ping => Ok(ResponseData::Ok),

        Method::GetState => Ok(ResponseData::State(facade.state())),

        Method::Start { config } => facade
            .start(config)
            .await
            .map(|_| ResponseData::Ok)
            .map_err(|e| e.to_string()),

        Method::Stop => facade
            .stop()
            .await
            .map(|_| ResponseData::Ok)
            .map_err(|e| e.to_string()),

        Method::ApplyConfig { config } => facade
            .apply_config(config)
            .await
            .map(|_| ResponseData::Ok)
            .map_err(|e| e.to_string()),

        Method::CheckUpdate => {
            facade.check_update();
            Ok(ResponseData::Ok)
        }

        Method::CancelUpdate => {
            facade.cancel_update();
            Ok(ResponseData::Ok)
        }

        Method::InstallStaged => facade
            .install_staged()
            .await
            .map(|_| ResponseData::Ok)
            .map_err(|e| e.to_string()),

        Method::ProbeLatency { url } => facade
            .probe_latency(&url)
            .await
            .map(|latency| ResponseData::Latency {
                millis: latency.as_millis() as u64,
            })
            .map_err(|e| e.to_string()),

        // Subscribe is intercepted in handle_connection
        Method::Subscribe => Ok(ResponseData::Ok),
    };

    Response { id, result }
}
