//! # resttunnel
//!
//! Serves a REST upstream over WebSocket, Server-Sent-Events and HTTP
//! long-poll using the JSON envelope protocol.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tunnel_server::{HttpProxyDispatcher, ServerConfig};
use tunnel_settings::TunnelSettings;
use tunnel_telemetry::{TelemetryConfig, init_telemetry};

/// REST tunnel server.
#[derive(Parser, Debug)]
#[command(name = "resttunnel", about = "REST over WebSocket, SSE and long-poll")]
struct Cli {
    /// Settings file (defaults to `~/.resttunnel/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Base URL of the REST service to tunnel (overrides settings).
    #[arg(long)]
    upstream: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<TunnelSettings> {
        let mut settings = match &self.config {
            Some(path) => tunnel_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => tunnel_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(upstream) = &self.upstream {
            settings.upstream.base_url = Some(upstream.clone());
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let telemetry =
        TelemetryConfig::from_level_str(&settings.logging.level, settings.logging.json)?;
    init_telemetry(&telemetry)?;

    let Some(base_url) = settings.upstream.base_url.clone() else {
        bail!("No upstream configured: pass --upstream or set TUNNEL_UPSTREAM_URL");
    };
    let timeout = Duration::from_secs(settings.upstream.timeout_secs);
    let dispatcher = HttpProxyDispatcher::new(&base_url, timeout)
        .context("Failed to build upstream client")?;
    tracing::info!(upstream = %base_url, "tunnelling upstream");

    let config = ServerConfig::from_settings(&settings);
    let handle = tunnel_server::start(config, Arc::new(dispatcher))
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port(), "resttunnel ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
