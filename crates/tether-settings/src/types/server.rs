//! Listener and process-level settings.

use serde::{Deserialize, Serialize};

/// Which transport the `tether` binary attaches to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Process stdin/stdout (the usual editor-spawned mode).
    #[default]
    Stdio,
    /// Plain TCP with header framing.
    Tcp,
    /// WebSocket text frames.
    Websocket,
}

/// Server network and runtime settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Transport used when none is given on the command line.
    pub transport: TransportKind,
    /// Bind address for TCP and WebSocket listeners.
    pub host: String,
    /// Listen port for TCP and WebSocket listeners.
    pub port: u16,
    /// HTTP path of the WebSocket upgrade route.
    pub websocket_path: String,
    /// Prefix each outgoing WebSocket frame with a `Content-Length` header block.
    pub ws_frame_headers: bool,
    /// Maximum number of simultaneously attached connections.
    pub max_connections: usize,
    /// Grace period for in-flight work on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            host: "127.0.0.1".to_string(),
            port: 2087,
            websocket_path: "/ws".to_string(),
            ws_frame_headers: true,
            max_connections: 64,
            shutdown_timeout_secs: 5,
        }
    }
}

/// Session behaviour settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Idle time after which a stored session counts as expired, in seconds.
    pub max_idle_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_idle_secs: 1800,
        }
    }
}
