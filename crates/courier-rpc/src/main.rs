//! Courier RPC Server - JSON-RPC front end for the messaging service.
//!
//! Serves JSON-RPC 2.0 over a WebSocket endpoint and, optionally, over a
//! length-prefixed TCP endpoint. Service events are pushed to every open
//! connection as `event.<type>` notifications.

mod handlers;
mod mux;
mod protocol;
mod server;

use anyhow::Result;
use clap::Parser;
use courier_core::config::{HistoryConfig, ServerConfig};
use courier_core::{LoopbackProvider, MessagingService, SqliteHistoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "courier-rpc")]
#[command(about = "JSON-RPC server for Courier")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "COURIER_HOST", default_value = ServerConfig::DEFAULT_HOST)]
    host: String,

    /// WebSocket port (0 = auto-assign)
    #[arg(short, long, env = "COURIER_PORT", default_value_t = ServerConfig::DEFAULT_PORT)]
    port: u16,

    /// Also serve length-prefixed JSON-RPC over TCP on this port
    #[arg(long, env = "COURIER_FRAMED_PORT")]
    framed_port: Option<u16>,

    /// Message history database
    #[arg(long, env = "COURIER_HISTORY_DB", default_value = HistoryConfig::DEFAULT_DB_PATH)]
    history_db: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Logs go to stderr; stdout carries the port announcements.
fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    info!("Starting {} RPC Server", ServerConfig::APP_NAME);

    let history = SqliteHistoryStore::open(&args.history_db)?;
    let service = MessagingService::builder(Arc::new(LoopbackProvider::new()))
        .history(Arc::new(history))
        .build()
        .await?;

    // A failed start leaves the service stopped; clients can retry via `start`.
    if let Err(e) = service.start().await {
        warn!("Messaging service did not start: {}", e);
    }

    let state = server::AppState::new(Arc::clone(&service));

    let addr = server::start_server(Arc::clone(&state), &args.host, args.port).await?;
    // Intentional stdout: launchers read the bound ports from here.
    println!("RPC_PORT={}", addr.port());

    let mut framed = match args.framed_port {
        Some(port) => {
            let handle = server::FramedServer::start(Arc::clone(&state), &args.host, port).await?;
            println!("FRAMED_PORT={}", handle.port);
            Some(handle)
        }
        None => None,
    };

    info!("RPC server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    state.shutdown.cancel();
    if let Some(handle) = framed.as_mut() {
        handle.shutdown();
    }
    service.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
