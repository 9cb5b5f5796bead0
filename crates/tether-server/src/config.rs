//! Server configuration derived from [`TetherSettings`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_rpc::{
    ConnectionSessionIdResolver, Dispatcher, DispatcherConfig, FrameLimits, InMemorySessionStore,
    RouteTable, SessionManager, TieBreak,
};
use tether_settings::{TetherSettings, TieBreakMode, TransportKind};

use crate::errors::ServerError;

/// Everything the server needs, resolved from settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// Transport the binary serves when none is given on the command line.
    pub transport: TransportKind,
    /// Listen host.
    pub host: String,
    /// Listen port (`0` picks a free one).
    pub port: u16,
    /// WebSocket upgrade path.
    pub websocket_path: String,
    /// Write a `Content-Length` header block into each WebSocket frame.
    pub ws_frame_headers: bool,
    /// Maximum simultaneously attached connections.
    pub max_connections: usize,
    /// Grace period for closing connections on shutdown.
    pub shutdown_timeout: Duration,
    /// Tie-break policy for the route table.
    pub tie_break: TieBreak,
    /// Framing limits for byte-stream transports.
    pub frame_limits: FrameLimits,
    /// Per-connection dispatcher tunables.
    pub dispatcher: DispatcherConfig,
    /// Idle limit for stored sessions.
    pub session_max_idle: Duration,
}

impl ServerConfig {
    /// Resolve a config from loaded settings.
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let server = &settings.server;
        let rpc = &settings.rpc;
        Self {
            transport: server.transport,
            host: server.host.clone(),
            port: server.port,
            websocket_path: server.websocket_path.clone(),
            ws_frame_headers: server.ws_frame_headers,
            max_connections: server.max_connections,
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout_secs),
            tie_break: match rpc.tie_break {
                TieBreakMode::Reject => TieBreak::Reject,
                TieBreakMode::FirstRegistered => TieBreak::FirstRegistered,
            },
            frame_limits: FrameLimits {
                max_header_bytes: rpc.max_header_bytes,
                max_frame_bytes: rpc.max_frame_bytes,
            },
            dispatcher: DispatcherConfig {
                handler_timeout: rpc.handler_timeout_ms.map(Duration::from_millis),
                request_timeout: rpc.request_timeout_ms.map(Duration::from_millis),
                outbound_queue: rpc.outbound_queue,
                inbound_queue: rpc.inbound_queue,
            },
            session_max_idle: Duration::from_secs(settings.session.max_idle_secs),
        }
    }

    /// `host:port` as a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ServerError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|_| ServerError::InvalidAddress(raw))
    }

    /// Empty route table using the configured tie-break.
    pub fn route_table(&self) -> RouteTable {
        RouteTable::with_tie_break(self.tie_break)
    }

    /// Dispatcher over `routes` with this config's tunables and an
    /// in-memory session store.
    pub fn build_dispatcher(&self, routes: RouteTable) -> Dispatcher {
        let sessions = SessionManager::new(
            Arc::new(InMemorySessionStore::new(self.session_max_idle)),
            Arc::new(ConnectionSessionIdResolver),
        );
        Dispatcher::new(routes)
            .with_config(self.dispatcher.clone())
            .with_sessions(sessions)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default())
    }
}
