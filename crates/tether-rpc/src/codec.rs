//! Message codec: one frame body to one [`Message`] and back.

use bytes::Bytes;
use tether_core::{JSONRPC_VERSION, Message, RawMessage};
use tracing::debug;

use crate::errors::CodecError;

/// Converts frame bodies to messages.
pub trait Codec: Send + Sync {
    /// Decode one frame body.
    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError>;

    /// Encode one message into a frame body.
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError>;
}

/// `serde_json` codec for JSON-RPC 2.0 envelopes.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError> {
        let raw: RawMessage = serde_json::from_slice(frame)?;
        if raw.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            debug!(jsonrpc = ?raw.jsonrpc, "non-2.0 envelope accepted");
        }
        Ok(Message::try_from(raw)?)
    }

    fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::{Value, json};
    use tether_core::{ErrorObject, RequestId};

    #[test]
    fn decode_request() {
        let msg = JsonCodec
            .decode(br#"{"jsonrpc":"2.0","id":7,"method":"a","params":[1]}"#)
            .unwrap();
        assert_matches!(msg, Message::Request(r) if r.id == RequestId::Number(7) && r.method == "a");
    }

    #[test]
    fn decode_tolerates_missing_version() {
        let msg = JsonCodec.decode(br#"{"method":"n"}"#).unwrap();
        assert_matches!(msg, Message::Notification(_));
    }

    #[test]
    fn decode_null_result_is_response() {
        let msg = JsonCodec.decode(br#"{"jsonrpc":"2.0","id":"x","result":null}"#).unwrap();
        assert!(msg.is_response());
    }

    #[test]
    fn malformed_json_is_json_error() {
        assert_matches!(JsonCodec.decode(b"{not json"), Err(CodecError::Json(_)));
    }

    #[test]
    fn bad_envelope_is_envelope_error() {
        let err = JsonCodec.decode(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_matches!(err, CodecError::InvalidEnvelope(_));
    }

    #[test]
    fn encode_writes_version() {
        let bytes = JsonCodec
            .encode(&Message::error(3, ErrorObject::cancelled()))
            .unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 3);
        assert_eq!(v["error"]["code"], -32800);
        assert!(v.get("result").is_none());
    }

    #[test]
    fn encode_then_decode_keeps_null_result() {
        let bytes = JsonCodec.encode(&Message::success(1, json!(null))).unwrap();
        let back = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(back, Message::success(1, Value::Null));
    }
}
