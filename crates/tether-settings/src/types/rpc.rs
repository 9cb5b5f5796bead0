//! Dispatch, framing and correlation settings.

use serde::{Deserialize, Serialize};

/// How the route table settles two equally specific matches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreakMode {
    /// Refuse to pick; the request fails with an ambiguity error.
    #[default]
    Reject,
    /// The earliest registration wins.
    FirstRegistered,
}

/// JSON-RPC engine settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcSettings {
    /// Tie-break policy for equally specific routes.
    pub tie_break: TieBreakMode,
    /// Upper bound on a single handler invocation. `None` means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_timeout_ms: Option<u64>,
    /// Default timeout for our own outbound requests. `None` means wait forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Capacity of the per-connection outbound write queue.
    pub outbound_queue: usize,
    /// Capacity of each inbound fan-out subscriber queue.
    pub inbound_queue: usize,
    /// Largest accepted frame body, in bytes.
    pub max_frame_bytes: usize,
    /// Largest accepted header block line, in bytes.
    pub max_header_bytes: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            tie_break: TieBreakMode::Reject,
            handler_timeout_ms: None,
            request_timeout_ms: None,
            outbound_queue: 256,
            inbound_queue: 256,
            max_frame_bytes: 16 * 1024 * 1024,
            max_header_bytes: 4096,
        }
    }
}
