//! Warden Daemon - supervises the proxy engine and stages signed updates

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wardend::facade::AppFacade;
use wardend::rpc_server;
use warden_common::config::{WardenConfig, CONFIG_PATH};
use warden_common::ipc::SOCKET_PATH;

#[derive(Parser, Debug)]
#[command(name = "wardend", version, about = "Warden proxy supervisor daemon")]
struct Args {
    /// Path to the daemon configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Path to the GUI RPC socket
    #[arg(long, default_value = SOCKET_PATH)]
    socket: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Warden Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match WardenConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            warn!("using default configuration: {e:#}");
            WardenConfig::default()
        }
    };

    let facade = Arc::new(AppFacade::new(config, env!("CARGO_PKG_VERSION"))?);

    let server = {
        let facade = Arc::clone(&facade);
        let socket = args.socket.clone();
        tokio::spawn(async move { rpc_server::start_server(&socket, facade).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down gracefully");
    server.abort();
    if let Err(e) = facade.stop().await {
        warn!("engine stop during shutdown failed: {e}");
    }
    let _ = tokio::fs::remove_file(&args.socket).await;

    Ok(())
}
