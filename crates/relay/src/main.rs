//! # relay
//!
//! Signaling relay binary: loads settings, starts the HTTP/WebSocket server
//! and drains every session on ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::metrics::install_recorder;
use relay_server::{RelayServer, ServerConfig};
use relay_settings::RelaySettings;

/// WebRTC signaling relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "WebRTC signaling relay")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, `0` for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. `debug` or `relay_server=trace` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Let the first joiner create a room without `"create": true`.
    #[arg(long)]
    implicit_create: bool,
}

impl Cli {
    fn apply(self, settings: &mut RelaySettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        if self.implicit_create {
            settings.rooms.implicit_create = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args
        .config
        .clone()
        .unwrap_or_else(relay_settings::settings_path);
    let mut settings = relay_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    relay_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics_handle = install_recorder().context("Failed to install metrics recorder")?;
    let server = RelayServer::new(ServerConfig::from(&settings), metrics_handle);

    let (addr, serve_handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;
    let status_handle = server.spawn_status_logger();

    tracing::info!(
        implicit_create = settings.rooms.implicit_create,
        policy = ?settings.rooms.relay_policy,
        "relay listening on ws://{addr}/ws"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(server.directory(), vec![serve_handle, status_handle], None)
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}
