//! # tether-core
//!
//! Wire vocabulary shared by every tether crate.
//!
//! - **Ids**: [`ConnectionId`], [`SessionId`] newtypes and the JSON-RPC [`RequestId`]
//! - **Messages**: the [`Message`] union of requests, notifications and responses
//! - **Errors**: [`ErrorObject`] wire bodies, the standard [`codes`], and
//!   [`ProtocolError`] for envelopes that fit none of the message shapes

#![deny(unsafe_code)]

pub mod codes;
pub mod errors;
pub mod ids;
pub mod message;

pub use errors::ProtocolError;
pub use ids::{ConnectionId, SessionId};
pub use message::{
    ErrorObject, JSONRPC_VERSION, Message, Notification, Outcome, RawMessage, Request, RequestId,
    Response,
};
