//! LSP base-protocol framing.
//!
//! ```text
//! Content-Length: 52\r\n
//! Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"tether/ping"}
//! ```
//!
//! Headers other than `Content-Length` are accepted and ignored. Any framing
//! violation is fatal: once the stream is out of sync there is no safe
//! resynchronisation point.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Size limits enforced while decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest header block, terminator included.
    pub max_header_bytes: usize,
    /// Largest body.
    pub max_frame_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 4096,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Framing protocol violation.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Underlying read or write failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Header block without a `Content-Length`.
    #[error("missing Content-Length header")]
    MissingContentLength,
    /// `Content-Length` is not a non-negative integer.
    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),
    /// No header terminator within the limit.
    #[error("header block exceeds {limit} bytes")]
    HeaderTooLong {
        /// Configured limit.
        limit: usize,
    },
    /// Announced body is larger than allowed.
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },
    /// A header line is not `Name: value`, or not UTF-8.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
}

#[derive(Clone, Copy, Debug)]
enum DecodeState {
    Header,
    Body(usize),
}

/// `Content-Length` frame codec.
#[derive(Debug)]
pub struct HeaderFraming {
    limits: FrameLimits,
    state: DecodeState,
}

impl HeaderFraming {
    /// Codec with the given limits.
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            state: DecodeState::Header,
        }
    }

    /// The limits in force.
    pub fn limits(&self) -> FrameLimits {
        self.limits
    }
}

impl Default for HeaderFraming {
    fn default() -> Self {
        Self::new(FrameLimits::default())
    }
}

impl Decoder for HeaderFraming {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(end) = find_terminator(src) else {
                        if src.len() > self.limits.max_header_bytes {
                            return Err(FramingError::HeaderTooLong {
                                limit: self.limits.max_header_bytes,
                            });
                        }
                        return Ok(None);
                    };
                    let block_len = end + HEADER_TERMINATOR.len();
                    if block_len > self.limits.max_header_bytes {
                        return Err(FramingError::HeaderTooLong {
                            limit: self.limits.max_header_bytes,
                        });
                    }
                    let len = parse_content_length(&src[..end])?;
                    if len > self.limits.max_frame_bytes {
                        return Err(FramingError::FrameTooLarge {
                            len,
                            limit: self.limits.max_frame_bytes,
                        });
                    }
                    src.advance(block_len);
                    src.reserve(len);
                    self.state = DecodeState::Body(len);
                }
                DecodeState::Body(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(src.split_to(len).freeze()));
                }
            }
        }
    }
}

impl Encoder<Bytes> for HeaderFraming {
    type Error = FramingError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), FramingError> {
        let header = frame_header(body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

/// Header block announcing a body of `len` bytes.
pub fn frame_header(len: usize) -> String {
    format!("Content-Length: {len}\r\n\r\n")
}

/// Strip an optional header block from a message that arrived whole (one
/// WebSocket text frame). Text starting with `{` or `[` is returned as is.
pub fn strip_header_block(text: &str) -> Result<&str, FramingError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }
    let end = find_terminator(text.as_bytes())
        .ok_or_else(|| FramingError::MalformedHeader("unterminated header block".into()))?;
    let len = parse_content_length(&text.as_bytes()[..end])?;
    let body = &text[end + HEADER_TERMINATOR.len()..];
    if body.len() != len {
        return Err(FramingError::MalformedHeader(format!(
            "Content-Length {len} does not match body of {} bytes",
            body.len()
        )));
    }
    Ok(body)
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

fn parse_content_length(block: &[u8]) -> Result<usize, FramingError> {
    let block = std::str::from_utf8(block)
        .map_err(|_| FramingError::MalformedHeader("header block is not UTF-8".into()))?;
    let mut content_length = None;
    for line in block.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FramingError::MalformedHeader(line.to_owned()))?;
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let value = value.trim();
            content_length = Some(
                value
                    .parse::<usize>()
                    .map_err(|_| FramingError::InvalidContentLength(value.to_owned()))?,
            );
        }
    }
    content_length.ok_or(FramingError::MissingContentLength)
}
