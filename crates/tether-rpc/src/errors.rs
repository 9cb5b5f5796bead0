//! Error types, one enum per concern.
//!
//! Only [`TransportError`] ever ends a connection. Everything else is scoped
//! to the single message or exchange it happened in.

use std::time::Duration;

use serde_json::Value;
use tether_core::{ErrorObject, ProtocolError, RequestId, SessionId, codes};
use thiserror::Error;

use crate::framing::FramingError;

/// Failure reported by a [`MethodHandler`](crate::MethodHandler).
#[derive(Debug, Error)]
pub enum RpcError {
    /// Required parameter missing or of the wrong shape.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Unexpected failure inside the handler.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// The handler observed its cancellation token and gave up.
    #[error("request cancelled")]
    Cancelled,

    /// Error body the handler wants the peer to see verbatim.
    #[error("{message} ({code})")]
    Custom {
        /// JSON-RPC error code.
        code: i64,
        /// Message placed on the wire.
        message: String,
        /// Optional structured data placed on the wire.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::Custom`] without data.
    pub fn custom(code: i64, message: impl Into<String>) -> Self {
        Self::Custom {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal",
            Self::Cancelled => "cancelled",
            Self::Custom { .. } => "custom",
        }
    }

    /// Wire body for this error.
    ///
    /// Handler error text stays in the local log: every variant except
    /// `Custom` becomes the generic `-32603` body.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::Custom {
                code,
                message,
                data,
            } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            _ => ErrorObject::internal(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_params(err.to_string())
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        Self::internal(format!("session: {err}"))
    }
}

/// Failure turning bytes into a [`Message`](tether_core::Message) or back.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not JSON, or JSON of the wrong type.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON that fits no JSON-RPC message shape.
    #[error(transparent)]
    InvalidEnvelope(#[from] ProtocolError),
}

/// Failure of the underlying byte transport. Always fatal for the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O failure on the socket or pipe.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The byte stream violated the framing protocol.
    #[error("framing error: {0}")]
    Framing(FramingError),
    /// The peer went away.
    #[error("transport closed")]
    Closed,
}

impl From<FramingError> for TransportError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Io(io) => Self::Io(io),
            other => Self::Framing(other),
        }
    }
}

/// Failure of one of our own outbound requests.
#[derive(Clone, Debug, Error)]
pub enum ExchangeError {
    /// The connection closed before a response arrived.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    /// Another outbound request with this id is still pending.
    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),
    /// No response within the local timeout.
    #[error("request {method} timed out after {after:?}")]
    Timeout {
        /// Method of the timed-out request.
        method: String,
        /// Elapsed limit.
        after: Duration,
    },
    /// The peer answered with an error body.
    #[error("peer returned error: {0}")]
    Remote(ErrorObject),
    /// The request parameters could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl ExchangeError {
    /// Whether the peer answered with `-32800`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Remote(err) if err.code == codes::REQUEST_CANCELLED)
    }
}

/// Failure in the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backing store failed.
    #[error("session store failure: {0}")]
    Store(String),
    /// The session expired while the exchange was running.
    #[error("session {0} has expired")]
    Expired(SessionId),
}
