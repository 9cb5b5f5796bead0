//! Client role: our own outbound requests and their correlation.
//!
//! [`PendingOutbound`] holds one oneshot slot per outstanding request id.
//! The dispatcher's response pump fulfils slots as responses arrive, in any
//! order. [`PeerClient`] is the user-facing handle for issuing requests and
//! notifications on a connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tether_core::{ConnectionId, Message, RequestId, Response, codes};
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::errors::ExchangeError;
use crate::outbound::OutboundSink;

type Slot = oneshot::Sender<Result<Response, ExchangeError>>;

/// Receiver half handed back by [`PendingOutbound::register`].
pub type PendingReceiver = oneshot::Receiver<Result<Response, ExchangeError>>;

#[derive(Default)]
struct PendingState {
    slots: HashMap<RequestId, Slot>,
    closed: bool,
}

/// Outstanding outbound requests of one connection.
#[derive(Default)]
pub struct PendingOutbound {
    state: Mutex<PendingState>,
}

impl PendingOutbound {
    /// Create an empty, open table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `id`.
    pub fn register(&self, id: RequestId) -> Result<PendingReceiver, ExchangeError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ExchangeError::ConnectionClosed);
        }
        if state.slots.contains_key(&id) {
            return Err(ExchangeError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        let _ = state.slots.insert(id, tx);
        Ok(rx)
    }

    /// Deliver a response to its slot. Returns `false` when no slot matched.
    pub fn fulfill(&self, response: Response) -> bool {
        let slot = self.state.lock().slots.remove(&response.id);
        match slot {
            Some(tx) => {
                // The caller may have given up (timeout); that still counts
                // as a match.
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding slot with `reason`. Returns how many failed.
    pub fn fail_all(&self, reason: &ExchangeError) -> usize {
        let slots: Vec<Slot> = self.state.lock().slots.drain().map(|(_, tx)| tx).collect();
        let count = slots.len();
        for tx in slots {
            let _ = tx.send(Err(reason.clone()));
        }
        count
    }

    /// Refuse new registrations and fail outstanding ones with
    /// [`ExchangeError::ConnectionClosed`].
    pub fn close(&self) -> usize {
        self.state.lock().closed = true;
        self.fail_all(&ExchangeError::ConnectionClosed)
    }

    /// Drop the slot for `id` without answering it.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.state.lock().slots.remove(id).is_some()
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.state.lock().slots.contains_key(id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PeerClient
// ─────────────────────────────────────────────────────────────────────────────

struct PeerInner {
    connection_id: ConnectionId,
    pending: Arc<PendingOutbound>,
    outbound: OutboundSink,
    next_id: AtomicI64,
    default_timeout: Option<Duration>,
}

/// Handle for calling the remote peer. Cheap to clone.
#[derive(Clone)]
pub struct PeerClient {
    inner: Arc<PeerInner>,
}

impl PeerClient {
    /// Client writing through `outbound` and correlating through `pending`.
    pub fn new(
        connection_id: ConnectionId,
        pending: Arc<PendingOutbound>,
        outbound: OutboundSink,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                connection_id,
                pending,
                outbound,
                next_id: AtomicI64::new(1),
                default_timeout,
            }),
        }
    }

    /// Client with no connection behind it.
    pub(crate) fn detached(connection_id: ConnectionId) -> Self {
        let (outbound, _rx) = OutboundSink::channel(1);
        let pending = Arc::new(PendingOutbound::new());
        let _ = pending.close();
        Self::new(connection_id, pending, outbound, None)
    }

    /// Connection this client writes to.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    /// Outstanding outbound requests.
    pub fn pending(&self) -> &PendingOutbound {
        &self.inner.pending
    }

    /// Start building a request.
    pub fn request(&self, method: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            client: self.clone(),
            method: method.into(),
            id: None,
            params: Ok(None),
            timeout: None,
        }
    }

    /// Send a request with params and wait for its result.
    pub async fn call<P: Serialize>(
        &self,
        method: impl Into<String>,
        params: P,
    ) -> Result<Value, ExchangeError> {
        self.request(method).params(params).exchange().await
    }

    /// Send a notification.
    pub async fn notify<P: Serialize>(
        &self,
        method: impl Into<String>,
        params: Option<P>,
    ) -> Result<(), ExchangeError> {
        let params = match params {
            Some(p) => encode_params(&p)?,
            None => None,
        };
        if self
            .inner
            .outbound
            .send(Message::notification(method, params))
            .await
        {
            Ok(())
        } else {
            Err(ExchangeError::ConnectionClosed)
        }
    }

    /// Ask the peer to cancel one of our outstanding requests. The waiting
    /// caller still receives whatever the peer answers (normally `-32800`).
    pub async fn cancel(&self, id: &RequestId) -> Result<(), ExchangeError> {
        self.notify(codes::CANCEL_REQUEST_METHOD, Some(json!({ "id": id })))
            .await
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("connection_id", &self.inner.connection_id)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

/// Serialize params; `null` (e.g. from `()`) means "no params member".
fn encode_params<P: Serialize>(params: &P) -> Result<Option<Value>, ExchangeError> {
    let value = serde_json::to_value(params).map_err(|e| ExchangeError::Encode(e.to_string()))?;
    Ok((!value.is_null()).then_some(value))
}

/// Builder for one outbound request.
#[must_use = "a request does nothing until `exchange` is awaited"]
pub struct RequestBuilder {
    client: PeerClient,
    method: String,
    id: Option<RequestId>,
    params: Result<Option<Value>, ExchangeError>,
    timeout: Option<Duration>,
}

impl RequestBuilder {
    /// Use an explicit id instead of the next counter value.
    pub fn id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set params from any serializable value.
    pub fn params<P: Serialize>(mut self, params: P) -> Self {
        self.params = encode_params(&params);
        self
    }

    /// Give up locally after `timeout`, overriding the client default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send the request and wait for the response.
    #[instrument(skip_all, fields(method = %self.method))]
    pub async fn exchange(self) -> Result<Value, ExchangeError> {
        let Self {
            client,
            method,
            id,
            params,
            timeout,
        } = self;
        let params = params?;
        let id = id.unwrap_or_else(|| client.next_id());
        let inner = &client.inner;

        // Register before sending so a fast response cannot miss its slot.
        let rx = inner.pending.register(id.clone())?;
        debug!(%id, "sending request");
        if !inner
            .outbound
            .send(Message::request(id.clone(), method.clone(), params))
            .await
        {
            let _ = inner.pending.remove(&id);
            return Err(ExchangeError::ConnectionClosed);
        }

        let received = match timeout.or(inner.default_timeout) {
            Some(after) => {
                if let Ok(received) = tokio::time::timeout(after, rx).await {
                    received
                } else {
                    let _ = inner.pending.remove(&id);
                    debug!(%id, ?after, "request timed out");
                    return Err(ExchangeError::Timeout { method, after });
                }
            }
            None => rx.await,
        };

        let response = received.map_err(|_| ExchangeError::ConnectionClosed)??;
        response.into_result().map_err(ExchangeError::Remote)
    }

    /// Like [`exchange`](Self::exchange), deserializing the result into `T`.
    pub async fn exchange_as<T: DeserializeOwned>(self) -> Result<T, ExchangeError> {
        let value = self.exchange().await?;
        serde_json::from_value(value).map_err(|e| ExchangeError::Encode(e.to_string()))
    }
}
