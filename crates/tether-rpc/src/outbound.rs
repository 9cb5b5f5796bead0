//! Per-connection outbound queue.
//!
//! Every write for a connection (responses, our requests, notifications)
//! goes through one bounded queue drained by a single writer task, so frames
//! never interleave on the wire.

use tether_core::Message;
use tokio::sync::mpsc;
use tracing::debug;

/// Cloneable handle to a connection's write queue.
#[derive(Clone, Debug)]
pub struct OutboundSink {
    tx: mpsc::Sender<Message>,
}

impl OutboundSink {
    /// Create a sink and the receiver the writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message, waiting for capacity.
    ///
    /// Returns `false` when the writer is gone (connection closed).
    pub async fn send(&self, message: Message) -> bool {
        match self.tx.send(message).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(message)) => {
                debug!(kind = message.kind(), "outbound queue closed, dropping message");
                false
            }
        }
    }

    /// Whether the writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
