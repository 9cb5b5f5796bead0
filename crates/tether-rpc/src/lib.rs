//! # tether-rpc
//!
//! Bidirectional JSON-RPC 2.0 over one duplex connection. Each attached
//! connection is served (inbound requests are routed to handlers) and can be
//! used as a client (outbound requests are correlated to their responses).
//!
//! - [`routing`]: specificity-ordered route table
//! - [`handler`]: the [`MethodHandler`] trait and closure adapters
//! - [`inflight`]: running requests and `$/cancelRequest`
//! - [`client`]: pending outbound slots and the [`PeerClient`]
//! - [`session`]: per-exchange session resolution and the commit lifecycle
//! - [`codec`], [`framing`], [`transport`]: bytes to messages
//! - [`fanout`]: the inbound multicast point
//! - [`dispatcher`]: ties it together per connection

#![deny(unsafe_code)]

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod errors;
pub mod fanout;
pub mod framing;
pub mod handler;
pub mod inflight;
pub mod outbound;
pub mod routing;
pub mod session;
pub mod transport;

pub use client::{PeerClient, PendingOutbound, RequestBuilder};
pub use codec::{Codec, JsonCodec};
pub use dispatcher::{ConnectionHandle, Dispatcher, DispatcherConfig};
pub use errors::{CodecError, ExchangeError, RpcError, SessionError, TransportError};
pub use fanout::InboundFanout;
pub use framing::{FrameLimits, FramingError, HeaderFraming, frame_header, strip_header_block};
pub use handler::{MethodHandler, RequestContext, handler_fn, typed_handler};
pub use inflight::{InFlightRegistry, InFlightTicket};
pub use outbound::OutboundSink;
pub use routing::{
    MethodsCondition, RequestCondition, RequestHead, RouteError, RouteMapping, RouteTable,
    TieBreak,
};
pub use session::{
    CommitState, ConnectionSessionIdResolver, Exchange, InMemorySessionStore, ResponseCommit,
    Session, SessionIdResolver, SessionManager, SessionStore,
};
pub use transport::{Connection, FrameSink, FrameSource};
