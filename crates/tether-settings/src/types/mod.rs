//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

mod logging;
mod rpc;
mod server;

pub use logging::*;
pub use rpc::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "transport": "tcp", "port": 9000 },
///   "rpc": { "tieBreak": "firstRegistered" },
///   "logging": { "level": "debug", "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Engine settings.
    pub rpc: RpcSettings,
    /// Session settings.
    pub session: SessionSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rpc.max_header_bytes < 64 {
            return Err(SettingsError::InvalidValue(format!(
                "rpc.maxHeaderBytes must be at least 64, got {}",
                self.rpc.max_header_bytes
            )));
        }
        if self.rpc.max_frame_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "rpc.maxFrameBytes must be positive".to_string(),
            ));
        }
        if self.rpc.outbound_queue == 0 || self.rpc.inbound_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "rpc queue capacities must be positive".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be positive".to_string(),
            ));
        }
        if !self.server.websocket_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.websocketPath must start with '/', got {:?}",
                self.server.websocket_path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        TetherSettings::default().validate().unwrap();
    }

    #[test]
    fn tiny_header_limit_rejected() {
        let mut s = TetherSettings::default();
        s.rpc.max_header_bytes = 10;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("maxHeaderBytes"));
    }

    #[test]
    fn zero_queue_rejected() {
        let mut s = TetherSettings::default();
        s.rpc.inbound_queue = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn relative_ws_path_rejected() {
        let mut s = TetherSettings::default();
        s.server.websocket_path = "ws".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn roundtrip_preserves_sections() {
        let mut s = TetherSettings::default();
        s.server.transport = TransportKind::Websocket;
        s.rpc.handler_timeout_ms = Some(1000);
        let json = serde_json::to_string(&s).unwrap();
        let back: TetherSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
