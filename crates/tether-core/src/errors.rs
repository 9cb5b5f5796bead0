//! Protocol-level error types.

use thiserror::Error;

/// A decoded JSON object that is not a valid JSON-RPC 2.0 envelope.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The member combination matches no message shape.
    #[error("invalid JSON-RPC envelope: {reason}")]
    InvalidEnvelope {
        /// Which rule the envelope broke.
        reason: &'static str,
    },
}

impl ProtocolError {
    pub(crate) const fn envelope(reason: &'static str) -> Self {
        Self::InvalidEnvelope { reason }
    }
}
