//! WebSocket transport adapter.
//!
//! Each text frame carries one whole message. Inbound frames may carry a
//! `Content-Length` header block in front of the JSON; outbound frames carry
//! one when `frame_headers` is set.

use std::future;
use std::io;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tether_rpc::{Connection, TransportError, frame_header, strip_header_block};

/// Wrap an upgraded socket as a [`Connection`].
pub fn ws_connection(socket: WebSocket, frame_headers: bool) -> Connection {
    let (sink, stream) = socket.split();
    ws_connection_from_parts(stream, sink, frame_headers)
}

/// Build a [`Connection`] from the two halves of a WebSocket.
///
/// A close frame ends the inbound stream. Ping and pong frames are skipped.
pub fn ws_connection_from_parts<St, Si, E>(stream: St, sink: Si, frame_headers: bool) -> Connection
where
    St: Stream<Item = Result<Message, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    Si: Sink<Message> + Send + 'static,
    Si::Error: std::error::Error + Send + Sync + 'static,
{
    let source = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(decode_frame(text.as_str())),
                Ok(Message::Binary(data)) => Some(
                    std::str::from_utf8(&data)
                        .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
                        .and_then(decode_frame),
                ),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
                Err(e) => Some(Err(TransportError::Io(io::Error::other(e)))),
            })
        });

    let sink = sink
        .sink_map_err(|e| TransportError::Io(io::Error::other(e)))
        .with(move |body: Bytes| future::ready(encode_frame(&body, frame_headers)));

    Connection::new(source, sink)
}

fn decode_frame(text: &str) -> Result<Bytes, TransportError> {
    let body = strip_header_block(text)?;
    Ok(Bytes::copy_from_slice(body.as_bytes()))
}

fn encode_frame(body: &[u8], frame_headers: bool) -> Result<Message, TransportError> {
    let body = std::str::from_utf8(body)
        .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    let text = if frame_headers {
        format!("{}{body}", frame_header(body.len()))
    } else {
        body.to_owned()
    };
    Ok(Message::Text(text.into()))
}
