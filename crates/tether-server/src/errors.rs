//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Failure to start or run a listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },
    /// `host:port` did not parse as a socket address.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
    /// Shutdown has begun; no new connections are accepted.
    #[error("server is shutting down")]
    ShuttingDown,
    /// Every connection slot is taken.
    #[error("connection limit of {0} reached")]
    AtCapacity(usize),
    /// Accept or serve loop failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
