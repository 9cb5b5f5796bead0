//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server accepts connections, `"draining"` once
    /// shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Currently attached connections, across all transports.
    pub connections: usize,
    /// Configured connection limit.
    pub max_connections: usize,
    /// Requests currently executing.
    pub inflight_requests: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    draining: bool,
    connections: usize,
    max_connections: usize,
    inflight_requests: usize,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        max_connections,
        inflight_requests,
    }
}
