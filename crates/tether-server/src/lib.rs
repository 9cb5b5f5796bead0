//! # tether-server
//!
//! Serves a tether dispatcher over TCP, process stdio and WebSocket.
//!
//! - [`server`]: accept loops, connection limit, Axum router
//! - [`websocket`]: WebSocket frames to a [`tether_rpc::Connection`]
//! - [`routes`]: built-in diagnostic methods
//! - [`shutdown`]: graceful drain via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::TetherServer;
