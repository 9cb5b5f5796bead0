//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tether_rpc::ConnectionHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates shutdown of the accept loops and every attached connection.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every connection and wait up to `timeout` for their cleanup.
    ///
    /// Closing a connection cancels its in-flight requests and fails its
    /// pending outbound requests. Returns `false` if the timeout elapsed first.
    pub async fn drain(&self, connections: Vec<ConnectionHandle>, timeout: Duration) -> bool {
        self.shutdown();
        info!(
            connection_count = connections.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining connections"
        );

        for conn in &connections {
            conn.close();
        }
        let all_closed = futures::future::join_all(connections.iter().map(|conn| conn.closed()));

        if tokio::time::timeout(timeout, all_closed).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some connections may still be open");
            return false;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
