//! `TetherServer`: accepts transports and attaches each to the dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use dashmap::DashMap;
use metrics::{counter, histogram};
use tether_core::ConnectionId;
use tether_rpc::{Connection, ConnectionHandle, Dispatcher};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::ws_connection;

const TCP: &str = "tcp";
const STDIO: &str = "stdio";
const WEBSOCKET: &str = "websocket";

/// Serves one dispatcher over TCP, stdio and WebSocket.
///
/// Cheap to clone; clones share connections, limits and shutdown state.
#[derive(Clone)]
pub struct TetherServer {
    config: Arc<ServerConfig>,
    dispatcher: Dispatcher,
    shutdown: Arc<ShutdownCoordinator>,
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    limiter: Arc<Semaphore>,
    start_time: Instant,
}

impl TetherServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config: Arc::new(config),
            dispatcher,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            connections: Arc::new(DashMap::new()),
            limiter,
            start_time: Instant::now(),
        }
    }

    /// Attach `connection`, holding one connection slot until it closes.
    pub fn attach(
        &self,
        connection: Connection,
        transport: &'static str,
    ) -> Result<ConnectionHandle, ServerError> {
        if self.shutdown.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }
        let permit = Arc::clone(&self.limiter)
            .try_acquire_owned()
            .map_err(|_| ServerError::AtCapacity(self.config.max_connections))?;

        let handle = self.dispatcher.attach(connection);
        counter!("connections_total", "transport" => transport).increment(1);
        let _ = self.connections.insert(handle.id().clone(), handle.clone());

        let connections = Arc::clone(&self.connections);
        let watched = handle.clone();
        let opened = Instant::now();
        let _watcher = tokio::spawn(async move {
            watched.closed().await;
            let _ = connections.remove(watched.id());
            drop(permit);
            counter!("disconnections_total", "transport" => transport).increment(1);
            histogram!("connection_duration_seconds", "transport" => transport)
                .record(opened.elapsed().as_secs_f64());
        });
        Ok(handle)
    }

    /// Bind a TCP listener on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Accept framed TCP connections until shutdown, then drain.
    pub async fn serve_tcp(&self, listener: TcpListener) {
        let token = self.shutdown.token();
        info!(addr = ?listener.local_addr().ok(), "tcp listener ready");
        loop {
            let accepted = tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
            match self.attach(Connection::tcp(stream, self.config.frame_limits), TCP) {
                Ok(handle) => debug!(connection = %handle.id(), %peer, "tcp connection accepted"),
                Err(e) => warn!(%peer, error = %e, "tcp connection rejected"),
            }
        }
        let _ = self.drain().await;
    }

    /// Serve process stdin/stdout until the peer hangs up or shutdown.
    pub async fn serve_stdio(&self) -> Result<(), ServerError> {
        let handle = self.attach(Connection::stdio(self.config.frame_limits), STDIO)?;
        let token = self.shutdown.token();
        tokio::select! {
            () = handle.closed() => info!("stdio peer hung up"),
            () = token.cancelled() => {}
        }
        let _ = self.drain().await;
        Ok(())
    }

    /// Serve HTTP (`/health` and the WebSocket route) until shutdown.
    pub async fn serve_websocket(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            addr = ?listener.local_addr().ok(),
            path = %self.config.websocket_path,
            "websocket listener ready"
        );
        let token = self.shutdown.token();
        let server = self.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                let _ = server.drain().await;
            })
            .await?;
        Ok(())
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(&self.config.websocket_path, get(ws_handler))
            .with_state(self.clone())
    }

    /// Close every attached connection, waiting up to the configured
    /// shutdown timeout.
    pub async fn drain(&self) -> bool {
        self.shutdown
            .drain(self.handles(), self.config.shutdown_timeout)
            .await
    }

    /// Handles of the currently attached connections.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn health(&self) -> HealthResponse {
        health::health_check(
            self.start_time,
            self.shutdown.is_shutting_down(),
            self.connection_count(),
            self.config.max_connections,
            self.dispatcher.inflight().len(),
        )
    }
}

impl std::fmt::Debug for TetherServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherServer")
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

/// GET /health
async fn health_handler(State(server): State<TetherServer>) -> Json<HealthResponse> {
    Json(server.health())
}

/// GET on the WebSocket path: upgrade and attach.
async fn ws_handler(State(server): State<TetherServer>, ws: WebSocketUpgrade) -> Response {
    if server.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if server.limiter.available_permits() == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let connection = ws_connection(socket, server.config.ws_frame_headers);
        match server.attach(connection, WEBSOCKET) {
            Ok(handle) => debug!(connection = %handle.id(), "websocket connection accepted"),
            Err(e) => warn!(error = %e, "websocket connection rejected"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tether_rpc::{FrameLimits, RouteTable};
    use tower::ServiceExt;

    fn make_server(max_connections: usize) -> TetherServer {
        let config = ServerConfig {
            max_connections,
            shutdown_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        };
        let dispatcher = config.build_dispatcher(RouteTable::new());
        TetherServer::new(config, dispatcher)
    }

    fn memory_connection() -> (Connection, Connection) {
        Connection::memory_pair(FrameLimits::default())
    }

    async fn wait_for_count(server: &TetherServer, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    // ── HTTP ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server(4);
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["max_connections"], 4);
    }

    #[tokio::test]
    async fn health_reports_draining() {
        let server = make_server(4);
        server.shutdown().shutdown();
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "draining");
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let server = make_server(4);
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(4);
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/nonexistent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // ── attach ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn attach_enforces_limit() {
        let server = make_server(1);
        let (a, _a_peer) = memory_connection();
        let (b, _b_peer) = memory_connection();

        let first = server.attach(a, TCP).unwrap();
        assert_eq!(server.connection_count(), 1);
        assert!(matches!(server.attach(b, TCP), Err(ServerError::AtCapacity(1))));

        first.close();
        first.closed().await;
        wait_for_count(&server, 0).await;

        let (c, _c_peer) = memory_connection();
        assert!(server.attach(c, TCP).is_ok());
    }

    #[tokio::test]
    async fn attach_refused_after_shutdown() {
        let server = make_server(4);
        server.shutdown().shutdown();
        let (a, _peer) = memory_connection();
        assert!(matches!(server.attach(a, TCP), Err(ServerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn drain_closes_everything() {
        let server = make_server(4);
        let (a, _a_peer) = memory_connection();
        let (b, _b_peer) = memory_connection();
        let a = server.attach(a, TCP).unwrap();
        let b = server.attach(b, WEBSOCKET).unwrap();

        assert!(server.drain().await);
        assert!(a.is_closed());
        assert!(b.is_closed());
        wait_for_count(&server, 0).await;
    }

    #[tokio::test]
    async fn serve_tcp_stops_on_shutdown() {
        let server = make_server(4);
        let listener = TetherServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.serve_tcp(listener).await }
        });
        server.shutdown().shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
