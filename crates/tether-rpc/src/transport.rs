//! Duplex frame transports.
//!
//! A [`Connection`] is a stream of inbound frame bodies plus a sink for
//! outbound ones. The dispatcher never sees sockets or headers.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tether_core::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::errors::TransportError;
use crate::framing::{FrameLimits, HeaderFraming};

/// Inbound frame bodies.
pub type FrameSource = BoxStream<'static, Result<Bytes, TransportError>>;

/// Outbound frame bodies.
pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = TransportError> + Send>>;

const MEMORY_PIPE_BYTES: usize = 64 * 1024;

/// One duplex connection to a peer.
pub struct Connection {
    id: ConnectionId,
    source: FrameSource,
    sink: FrameSink,
}

impl Connection {
    /// Connection over an arbitrary frame stream and sink.
    pub fn new<S, K>(source: S, sink: K) -> Self
    where
        S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
        K: Sink<Bytes, Error = TransportError> + Send + 'static,
    {
        Self {
            id: ConnectionId::new(),
            source: source.boxed(),
            sink: Box::pin(sink),
        }
    }

    /// `Content-Length` framing over any byte reader and writer.
    pub fn from_io<R, W>(reader: R, writer: W, limits: FrameLimits) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let source = FramedRead::new(reader, HeaderFraming::new(limits))
            .map(|frame| frame.map_err(TransportError::from));
        let sink = FramedWrite::new(writer, HeaderFraming::new(limits))
            .sink_map_err(TransportError::from);
        Self::new(source, sink)
    }

    /// Framed TCP socket.
    pub fn tcp(stream: TcpStream, limits: FrameLimits) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_io(reader, writer, limits)
    }

    /// Framed process stdin/stdout.
    pub fn stdio(limits: FrameLimits) -> Self {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout(), limits)
    }

    /// Two connections wired to each other in memory.
    pub fn memory_pair(limits: FrameLimits) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(MEMORY_PIPE_BYTES);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::from_io(left_read, left_write, limits),
            Self::from_io(right_read, right_write, limits),
        )
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Split into id, source and sink.
    pub fn into_parts(self) -> (ConnectionId, FrameSource, FrameSink) {
        (self.id, self.source, self.sink)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish_non_exhaustive()
    }
}
