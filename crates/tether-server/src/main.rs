//! # tether
//!
//! JSON-RPC endpoint binary: loads settings, starts logging, registers the
//! built-in routes and serves one transport until Ctrl-C.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tether_server::routes::register_builtin;
use tether_server::{ServerConfig, TetherServer};
use tether_settings::{TetherSettings, TransportKind};
use tracing::{info, warn};

/// Bidirectional JSON-RPC endpoint.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Bidirectional JSON-RPC endpoint")]
#[command(group(ArgGroup::new("transport").args(["stdio", "tcp", "websocket"])))]
struct Cli {
    /// Serve on process stdin/stdout.
    #[arg(long)]
    stdio: bool,

    /// Listen for framed TCP connections on this address.
    #[arg(long, value_name = "ADDR")]
    tcp: Option<SocketAddr>,

    /// Listen for WebSocket connections on this address.
    #[arg(long, value_name = "ADDR")]
    websocket: Option<SocketAddr>,

    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,
}

/// Resolved transport to serve.
#[derive(Debug, PartialEq, Eq)]
enum Listen {
    Stdio,
    Tcp(SocketAddr),
    Websocket(SocketAddr),
}

impl Cli {
    /// Settings from `--settings` or the default path, with env overrides.
    fn load_settings(&self) -> Result<TetherSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(tether_settings::settings_path);
        tether_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))
    }

    /// Command-line choice, falling back to the configured transport.
    fn listen(&self, config: &ServerConfig) -> Result<Listen> {
        if self.stdio {
            return Ok(Listen::Stdio);
        }
        if let Some(addr) = self.tcp {
            return Ok(Listen::Tcp(addr));
        }
        if let Some(addr) = self.websocket {
            return Ok(Listen::Websocket(addr));
        }
        Ok(match config.transport {
            TransportKind::Stdio => Listen::Stdio,
            TransportKind::Tcp => Listen::Tcp(config.listen_addr()?),
            TransportKind::Websocket => Listen::Websocket(config.listen_addr()?),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = cli.load_settings()?;
    tether_logging::init_logging(&settings.logging).context("Failed to initialize logging")?;

    let config = ServerConfig::from_settings(&settings);
    if tether_settings::init_settings(settings).is_err() {
        warn!("global settings were already initialized");
    }
    let listen = cli.listen(&config)?;

    let mut routes = config.route_table();
    register_builtin(&mut routes);
    let dispatcher = config.build_dispatcher(routes);
    let server = TetherServer::new(config, dispatcher);

    let signal_server = server.clone();
    let _signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                signal_server.shutdown().shutdown();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    info!(?listen, "tether starting");
    match listen {
        Listen::Stdio => server.serve_stdio().await?,
        Listen::Tcp(addr) => {
            let listener = TetherServer::bind(addr).await?;
            server.serve_tcp(listener).await;
        }
        Listen::Websocket(addr) => {
            let listener = TetherServer::bind(addr).await?;
            server.serve_websocket(listener).await?;
        }
    }
    info!("tether stopped");
    Ok(())
}
