//! JSON-RPC 2.0 message model.
//!
//! Every unit on the wire is one of three shapes, told apart by which
//! members are present:
//!
//! | shape        | `method` | `id` | `result` / `error` |
//! |--------------|----------|------|--------------------|
//! | request      | yes      | yes  | no                 |
//! | notification | yes      | no   | no                 |
//! | response     | no       | yes  | exactly one        |
//!
//! [`RawMessage`] is the flat serde form; [`Message`] is the classified form
//! the rest of the workspace works with. Conversion happens in
//! `TryFrom<RawMessage>` so `serde_json::from_slice::<Message>` rejects
//! envelopes that fit none of the shapes.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::codes;
use crate::errors::ProtocolError;

/// Protocol version written on every outgoing envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request id. Peers may use numbers or strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// The `error` member of a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code (see [`codes`]).
    pub code: i64,
    /// Short human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Build an error body with no data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32601` for a method with no route.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// `-32603` with the generic message sent for every handler failure.
    pub fn internal() -> Self {
        Self::new(codes::INTERNAL_ERROR, "internal server error")
    }

    /// `-32800` for a request cancelled through `$/cancelRequest`.
    pub fn cancelled() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "request cancelled")
    }

    /// `-32600` for a structurally valid but unacceptable request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// A call that expects exactly one response.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Correlation id chosen by the caller.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Parameters, passed through untouched.
    pub params: Option<Value>,
}

/// A call that is never answered.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Parameters, passed through untouched.
    pub params: Option<Value>,
}

/// Result or error half of a response.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Successful result (may be `null`).
    Result(Value),
    /// Failure body.
    Error(ErrorObject),
}

/// The answer to a [`Request`].
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Result or error.
    pub outcome: Outcome,
}

impl Response {
    /// Build a success response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    /// Build an error response.
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }

    /// Whether this response carries an error.
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Error body, if any.
    pub fn error_object(&self) -> Option<&ErrorObject> {
        match &self.outcome {
            Outcome::Error(err) => Some(err),
            Outcome::Result(_) => None,
        }
    }

    /// Convert into a plain `Result`.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err),
        }
    }
}

/// One decoded JSON-RPC unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum Message {
    /// Inbound or outbound call expecting a response.
    Request(Request),
    /// Fire-and-forget call.
    Notification(Notification),
    /// Answer to an earlier request.
    Response(Response),
}

impl Message {
    /// Build a request message.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Build a success response message.
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self::Response(Response::success(id.into(), result))
    }

    /// Build an error response message.
    pub fn error(id: impl Into<RequestId>, error: ErrorObject) -> Self {
        Self::Response(Response::error(id.into(), error))
    }

    /// Request id, when the message has one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }

    /// Method name, when the message has one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Whether this is a response (has `result` or `error`).
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    /// Short shape name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
        }
    }
}

/// Flat serde representation of a JSON-RPC envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Protocol version (`"2.0"`); tolerated when missing on input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Request id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result; `Some(Value::Null)` when the member is present and `null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Error body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Distinguish `"result": null` (present) from a missing member.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawMessage> for Message {
    type Error = ProtocolError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match (raw.method, raw.id, raw.result, raw.error) {
            (Some(method), Some(id), None, None) => Ok(Self::Request(Request {
                id,
                method,
                params: raw.params,
            })),
            (Some(method), None, None, None) => Ok(Self::Notification(Notification {
                method,
                params: raw.params,
            })),
            (Some(_), _, _, _) => Err(ProtocolError::envelope(
                "message carries both a method and a result or error",
            )),
            (None, Some(_), Some(_), Some(_)) => Err(ProtocolError::envelope(
                "response carries both result and error",
            )),
            (None, Some(id), Some(result), None) => Ok(Self::Response(Response::success(id, result))),
            (None, Some(id), None, Some(error)) => Ok(Self::Response(Response::error(id, error))),
            (None, Some(_), None, None) => Err(ProtocolError::envelope(
                "response carries neither result nor error",
            )),
            (None, None, _, _) => Err(ProtocolError::envelope("message has neither method nor id")),
        }
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let mut raw = Self {
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            ..Self::default()
        };
        match message {
            Message::Request(r) => {
                raw.id = Some(r.id);
                raw.method = Some(r.method);
                raw.params = r.params;
            }
            Message::Notification(n) => {
                raw.method = Some(n.method);
                raw.params = n.params;
            }
            Message::Response(r) => {
                raw.id = Some(r.id);
                match r.outcome {
                    Outcome::Result(value) => raw.result = Some(value),
                    Outcome::Error(err) => raw.error = Some(err),
                }
            }
        }
        raw
    }
}
