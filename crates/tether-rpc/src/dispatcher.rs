//! Per-connection dispatch.
//!
//! [`Dispatcher::attach`] spawns the tasks that serve one connection:
//!
//! | task       | job                                                              |
//! |------------|------------------------------------------------------------------|
//! | reader     | the only reader of the frame source; decodes and publishes       |
//! | requests   | routes requests and notifications, handles `$/cancelRequest`      |
//! | responses  | fulfils pending outbound slots                                   |
//! | writer     | the only writer of the frame sink; drains the outbound queue     |
//! | supervisor | on close: cancels in-flight work, fails pending slots            |
//!
//! Every handler invocation runs on its own task, so a slow handler never
//! holds up the reader or other requests.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, SinkExt, StreamExt};
use metrics::{counter, histogram};
use serde_json::Value;
use tether_core::{
    ConnectionId, ErrorObject, Message, Notification, Request, RequestId, codes,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{PeerClient, PendingOutbound};
use crate::codec::{Codec, JsonCodec};
use crate::errors::RpcError;
use crate::fanout::InboundFanout;
use crate::handler::{MethodHandler, RequestContext};
use crate::inflight::{InFlightRegistry, InFlightTicket};
use crate::outbound::OutboundSink;
use crate::routing::{RequestHead, RouteError, RouteTable};
use crate::session::{Exchange, SessionManager};
use crate::transport::{Connection, FrameSink, FrameSource};

const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
const RPC_CANCELLATIONS_TOTAL: &str = "rpc_cancellations_total";
const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
const RPC_DECODE_ERRORS_TOTAL: &str = "rpc_decode_errors_total";

const SLOW_REQUEST: Duration = Duration::from_secs(5);

/// Tunables for every connection a dispatcher serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Limit on one handler invocation. `None` imposes none.
    pub handler_timeout: Option<Duration>,
    /// Default timeout for requests issued through the [`PeerClient`].
    pub request_timeout: Option<Duration>,
    /// Capacity of the outbound write queue.
    pub outbound_queue: usize,
    /// Capacity of each inbound fan-out queue.
    pub inbound_queue: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: None,
            request_timeout: None,
            outbound_queue: 256,
            inbound_queue: 256,
        }
    }
}

/// Serves connections with a shared route table.
#[derive(Clone)]
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    codec: Arc<dyn Codec>,
    inflight: Arc<InFlightRegistry>,
    sessions: Arc<SessionManager>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Dispatcher with the JSON codec, an in-memory session store keyed by
    /// connection, and default config.
    pub fn new(routes: RouteTable) -> Self {
        Self {
            routes: Arc::new(routes),
            codec: Arc::new(JsonCodec),
            inflight: Arc::new(InFlightRegistry::new()),
            sessions: Arc::new(SessionManager::default()),
            config: DispatcherConfig::default(),
        }
    }

    /// Replace the config.
    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the session manager.
    #[must_use]
    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    /// Route table.
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Requests currently executing, across all attached connections.
    pub fn inflight(&self) -> &InFlightRegistry {
        &self.inflight
    }

    /// Session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Config in force.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start serving `connection`. Must be called inside a Tokio runtime.
    pub fn attach(&self, connection: Connection) -> ConnectionHandle {
        let (connection_id, source, sink) = connection.into_parts();
        info!(connection = %connection_id, "connection attached");

        let (outbound, outbound_rx) = OutboundSink::channel(self.config.outbound_queue);
        let pending = Arc::new(PendingOutbound::new());
        let peer = PeerClient::new(
            connection_id.clone(),
            Arc::clone(&pending),
            outbound.clone(),
            self.config.request_timeout,
        );
        let stop = CancellationToken::new();
        let closed = CancellationToken::new();

        let fanout = Arc::new(InboundFanout::new());
        let requests_rx = fanout.subscribe_filtered(self.config.inbound_queue, |m: &Message| {
            !m.is_response()
        });
        let responses_rx =
            fanout.subscribe_filtered(self.config.inbound_queue, Message::is_response);

        let state = Arc::new(ConnectionState {
            connection_id: connection_id.clone(),
            outbound,
            peer: peer.clone(),
            scope: stop.child_token(),
            dispatcher: self.clone(),
        });

        let writer = tokio::spawn(write_loop(
            connection_id.clone(),
            sink,
            outbound_rx,
            Arc::clone(&self.codec),
            stop.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            connection_id.clone(),
            source,
            Arc::clone(&self.codec),
            fanout,
            stop.clone(),
        ));
        let requests = tokio::spawn(pump_requests(Arc::clone(&state), requests_rx));
        let responses = tokio::spawn(pump_responses(Arc::clone(&pending), responses_rx));

        let inflight = Arc::clone(&self.inflight);
        let supervisor_stop = stop.clone();
        let supervisor_closed = closed.clone();
        let supervisor_id = connection_id.clone();
        let _supervisor = tokio::spawn(async move {
            let _ = reader.await;
            let _ = requests.await;
            let _ = responses.await;
            let cancelled = inflight.cancel_connection(&supervisor_id);
            let failed = pending.close();
            state.scope.cancel();
            supervisor_stop.cancel();
            let _ = writer.await;
            info!(
                connection = %supervisor_id,
                cancelled,
                failed,
                "connection closed"
            );
            supervisor_closed.cancel();
        });

        ConnectionHandle {
            id: connection_id,
            peer,
            stop,
            closed,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to an attached connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: PeerClient,
    stop: CancellationToken,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Client for calling the peer.
    pub fn peer(&self) -> &PeerClient {
        &self.peer
    }

    /// Ask the connection to shut down. Cleanup runs asynchronously; await
    /// [`closed`](Self::closed) to know when it is done.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Resolves once the connection is closed and cleaned up.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether cleanup has finished.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// I/O loops
// ─────────────────────────────────────────────────────────────────────────────

#[instrument(skip_all, fields(connection = %connection_id))]
async fn read_loop(
    connection_id: ConnectionId,
    mut source: FrameSource,
    codec: Arc<dyn Codec>,
    fanout: Arc<InboundFanout<Message>>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            frame = source.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                warn!(error = %err, "transport failed, closing connection");
                break;
            }
            None => {
                debug!("peer closed the stream");
                break;
            }
        };
        let message = match codec.decode(&bytes) {
            Ok(message) => message,
            Err(err) => {
                counter!(RPC_DECODE_ERRORS_TOTAL).increment(1);
                warn!(error = %err, len = bytes.len(), "dropping undecodable message");
                continue;
            }
        };
        debug!(kind = message.kind(), id = ?message.id(), method = ?message.method(), "received");
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = fanout.publish(message) => {}
        }
    }
    fanout.close();
}

#[instrument(skip_all, fields(connection = %connection_id))]
async fn write_loop(
    connection_id: ConnectionId,
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Message>,
    codec: Arc<dyn Codec>,
    stop: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else { break };
        let bytes = match codec.encode(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, kind = message.kind(), "failed to encode outbound message");
                continue;
            }
        };
        let written = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            written = sink.send(bytes) => written,
        };
        if let Err(err) = written {
            warn!(error = %err, "write failed, closing connection");
            stop.cancel();
            break;
        }
    }
    rx.close();
    if let Err(err) = sink.close().await {
        debug!(error = %err, "error closing sink");
    }
}

async fn pump_responses(pending: Arc<PendingOutbound>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Message::Response(response) = message {
            let id = response.id.clone();
            if !pending.fulfill(response) {
                debug!(%id, "response with no pending request, dropping");
            }
        }
    }
}

async fn pump_requests(state: Arc<ConnectionState>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Notification(note) if note.method == codes::CANCEL_REQUEST_METHOD => {
                state.handle_cancel(note.params.as_ref()).await;
            }
            Message::Notification(note) => state.handle_notification(note),
            Message::Request(request) => state.handle_request(request).await,
            Message::Response(_) => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request handling
// ─────────────────────────────────────────────────────────────────────────────

struct ConnectionState {
    connection_id: ConnectionId,
    outbound: OutboundSink,
    peer: PeerClient,
    /// Parent of every handler token on this connection.
    scope: CancellationToken,
    dispatcher: Dispatcher,
}

impl ConnectionState {
    async fn reply(&self, message: Message) {
        if !self.outbound.send(message).await {
            debug!(connection = %self.connection_id, "connection closed before reply was queued");
        }
    }

    async fn handle_cancel(&self, params: Option<&Value>) {
        let Some(target) = cancel_target(params) else {
            warn!(connection = %self.connection_id, "malformed $/cancelRequest, ignoring");
            return;
        };
        if self.dispatcher.inflight.cancel(&self.connection_id, &target) {
            counter!(RPC_CANCELLATIONS_TOTAL).increment(1);
            debug!(connection = %self.connection_id, id = %target, "request cancelled");
            self.reply(Message::error(target, ErrorObject::cancelled())).await;
        } else {
            debug!(connection = %self.connection_id, id = %target, "cancel for unknown or finished request");
        }
    }

    fn resolve(&self, method: &str, params: Option<&Value>) -> Result<Arc<dyn MethodHandler>, RouteError> {
        let head = RequestHead::new(method).with_params(params);
        self.dispatcher.routes.resolve(&head)
    }

    async fn handle_request(self: &Arc<Self>, request: Request) {
        counter!(RPC_REQUESTS_TOTAL, "method" => request.method.clone()).increment(1);

        let handler = match self.resolve(&request.method, request.params.as_ref()) {
            Ok(handler) => handler,
            Err(RouteError::NoHandlerFound { .. }) => {
                counter!(RPC_ERRORS_TOTAL, "method" => request.method.clone(), "error_type" => "method_not_found").increment(1);
                debug!(connection = %self.connection_id, id = %request.id, method = %request.method, "no handler");
                let body = ErrorObject::method_not_found(&request.method);
                self.reply(Message::error(request.id, body)).await;
                return;
            }
            Err(err @ RouteError::Ambiguous { .. }) => {
                counter!(RPC_ERRORS_TOTAL, "method" => request.method.clone(), "error_type" => "ambiguous").increment(1);
                warn!(connection = %self.connection_id, id = %request.id, error = %err, "ambiguous route");
                let body = ErrorObject::new(codes::INTERNAL_ERROR, "ambiguous handler mapping");
                self.reply(Message::error(request.id, body)).await;
                return;
            }
        };

        let token = self.scope.child_token();
        let Some(ticket) = self
            .dispatcher
            .inflight
            .begin(&self.connection_id, &request.id, token)
        else {
            counter!(RPC_ERRORS_TOTAL, "method" => request.method.clone(), "error_type" => "duplicate_id").increment(1);
            warn!(connection = %self.connection_id, id = %request.id, "duplicate in-flight request id");
            let body = ErrorObject::invalid_request("duplicate request id");
            self.reply(Message::error(request.id, body)).await;
            return;
        };

        let _task = tokio::spawn(Arc::clone(self).run_request(handler, request, ticket));
    }

    #[instrument(skip_all, fields(connection = %self.connection_id, id = %request.id, method = %request.method))]
    async fn run_request(
        self: Arc<Self>,
        handler: Arc<dyn MethodHandler>,
        request: Request,
        ticket: InFlightTicket,
    ) {
        let Request { id, method, params } = request;
        let start = Instant::now();
        let exchange = Exchange::new(self.connection_id.clone(), Some(id.clone()), method.clone());
        let guard = TicketGuard {
            registry: &self.dispatcher.inflight,
            ticket,
        };
        let ticket = &guard.ticket;

        let outcome = tokio::select! {
            biased;
            () = ticket.token().cancelled() => None,
            result = self.invoke_guarded(&handler, &exchange, params, ticket.token().clone()) => Some(result),
        };
        let elapsed = start.elapsed();
        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.clone())
            .record(elapsed.as_secs_f64());

        let Some(result) = outcome else {
            debug!("handler abandoned after cancellation");
            return;
        };
        if !ticket.try_resolve() {
            debug!("request already answered, discarding result");
            return;
        }
        if elapsed >= SLOW_REQUEST {
            warn!(duration_secs = elapsed.as_secs_f64(), "slow request");
        }

        let mut reply = match result {
            Ok(value) => Message::success(id.clone(), value),
            Err(err) => {
                counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => err.kind()).increment(1);
                error!(error = %err, "handler failed");
                Message::error(id.clone(), err.to_error_object())
            }
        };
        if let Err(err) = exchange.commit().commit().await {
            counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => "session").increment(1);
            error!(error = %err, "session save failed");
            reply = Message::error(id, ErrorObject::internal());
        }
        // The id must be free again before the peer can see the response.
        drop(guard);
        self.reply(reply).await;
    }

    fn handle_notification(self: &Arc<Self>, note: Notification) {
        let handler = match self.resolve(&note.method, note.params.as_ref()) {
            Ok(handler) => handler,
            Err(err) => {
                debug!(connection = %self.connection_id, error = %err, "notification not routed");
                return;
            }
        };
        let _task = tokio::spawn(Arc::clone(self).run_notification(handler, note));
    }

    #[instrument(skip_all, fields(connection = %self.connection_id, method = %note.method))]
    async fn run_notification(self: Arc<Self>, handler: Arc<dyn MethodHandler>, note: Notification) {
        let Notification { method, params } = note;
        let token = self.scope.child_token();
        let exchange = Exchange::new(self.connection_id.clone(), None, method);
        let result = tokio::select! {
            biased;
            () = token.cancelled() => return,
            result = self.invoke_guarded(&handler, &exchange, params, token.clone()) => result,
        };
        if let Err(err) = result {
            error!(error = %err, "notification handler failed");
        }
        if let Err(err) = exchange.commit().commit().await {
            error!(error = %err, "session save failed");
        }
    }

    /// [`Self::invoke`], with a panicking handler turned into an internal
    /// error so the exchange still completes.
    async fn invoke_guarded(
        &self,
        handler: &Arc<dyn MethodHandler>,
        exchange: &Exchange,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value, RpcError> {
        match AssertUnwindSafe(self.invoke(handler, exchange, params, token))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "handler panicked");
                Err(RpcError::internal(format!("handler panicked: {message}")))
            }
        }
    }

    async fn invoke(
        &self,
        handler: &Arc<dyn MethodHandler>,
        exchange: &Exchange,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value, RpcError> {
        let session = self.dispatcher.sessions.resolve(exchange).await?;
        let ctx = RequestContext::new(
            self.connection_id.clone(),
            exchange.request_id().cloned(),
            exchange.method().to_owned(),
            token,
            session,
            self.peer.clone(),
            Arc::clone(&self.dispatcher.routes),
        );
        match self.dispatcher.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.handle(params, &ctx)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    counter!(RPC_ERRORS_TOTAL, "method" => exchange.method().to_owned(), "error_type" => "timeout").increment(1);
                    Err(RpcError::internal(format!("handler timed out after {limit:?}")))
                }
            },
            None => handler.handle(params, &ctx).await,
        }
    }
}

/// Owns a request's in-flight entry and removes it when dropped.
struct TicketGuard<'a> {
    registry: &'a InFlightRegistry,
    ticket: InFlightTicket,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        let _ = self.registry.release(&self.ticket);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// `params.id` of a `$/cancelRequest`.
fn cancel_target(params: Option<&Value>) -> Option<RequestId> {
    let id = params?.get("id")?;
    serde_json::from_value(id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameLimits;
    use crate::handler::handler_fn;
    use crate::routing::RouteMapping;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tether_core::Response;
    use tokio::sync::Notify;

    /// The far side of a connection, speaking raw messages.
    struct RawPeer {
        source: FrameSource,
        sink: FrameSink,
    }

    impl RawPeer {
        async fn send(&mut self, value: Value) {
            let bytes = serde_json::to_vec(&value).unwrap();
            self.sink.send(bytes.into()).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.source.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .unwrap();
            JsonCodec.decode(&frame).unwrap()
        }

        async fn recv_response(&mut self) -> Response {
            match self.recv().await {
                Message::Response(r) => r,
                other => panic!("expected response, got {other:?}"),
            }
        }
    }

    fn serve(routes: RouteTable, config: DispatcherConfig) -> (Dispatcher, ConnectionHandle, RawPeer) {
        let (ours, theirs) = Connection::memory_pair(FrameLimits::default());
        let dispatcher = Dispatcher::new(routes).with_config(config);
        let handle = dispatcher.attach(ours);
        let (_, source, sink) = theirs.into_parts();
        (dispatcher, handle, RawPeer { source, sink })
    }

    fn ping_routes() -> RouteTable {
        let mut routes = RouteTable::new();
        routes.route("ping", handler_fn(|_, _| async { Ok(json!("pong")) }));
        routes
    }

    // ── Routing outcomes ────────────────────────────────────────────

    #[tokio::test]
    async fn request_gets_result() {
        let (_d, _h, mut peer) = serve(ping_routes(), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(resp.into_result().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (_d, _h, mut peer) = serve(ping_routes(), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": "a", "method": "nope"})).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::from("a"));
        let err = resp.error_object().unwrap();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert_eq!(err.message, "method not found: nope");
    }

    #[tokio::test]
    async fn ambiguous_route_is_internal_error() {
        let mut routes = RouteTable::new();
        routes.route("dup", handler_fn(|_, _| async { Ok(json!(1)) }));
        routes.route("dup", handler_fn(|_, _| async { Ok(json!(2)) }));
        let (_d, _h, mut peer) = serve(routes, DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "dup"})).await;
        let err = peer.recv_response().await.into_result().unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert_eq!(err.message, "ambiguous handler mapping");
    }

    #[tokio::test]
    async fn failing_handler_hides_error_text() {
        let mut routes = RouteTable::new();
        routes.route(
            "boom",
            handler_fn(|_, _| async { Err(RpcError::internal("secret detail")) }),
        );
        let (_d, _h, mut peer) = serve(routes, DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 9, "method": "boom"})).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::Number(9));
        let err = resp.into_result().unwrap_err();
        assert_eq!(err, ErrorObject::internal());
    }

    fn panicking_routes() -> RouteTable {
        let mut routes = ping_routes();
        routes.route(
            "explode",
            handler_fn(|params: Option<Value>, _| async move {
                if params.is_none() {
                    panic!("handler bug");
                }
                Ok(json!("survived"))
            }),
        );
        routes
    }

    #[tokio::test]
    async fn panicking_handler_gets_internal_error() {
        let (dispatcher, _h, mut peer) = serve(panicking_routes(), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "explode"})).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::Number(1));
        let err = resp.into_result().unwrap_err();
        assert_eq!(err, ErrorObject::internal());
        assert!(!err.message.contains("handler bug"));
        assert!(dispatcher.inflight().is_empty());
    }

    #[tokio::test]
    async fn id_is_reusable_after_handler_panics() {
        let (_d, _h, mut peer) = serve(panicking_routes(), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "explode"})).await;
        let _ = peer.recv_response().await;

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "explode", "params": {}}))
            .await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(resp.into_result().unwrap(), json!("survived"));
    }

    #[tokio::test]
    async fn panicking_notification_leaves_connection_usable() {
        let (_d, _h, mut peer) = serve(panicking_routes(), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "method": "explode"})).await;
        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.into_result().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn custom_error_passes_through() {
        let mut routes = RouteTable::new();
        routes.route(
            "custom",
            handler_fn(|_, _| async { Err(RpcError::custom(-32001, "document closed")) }),
        );
        let (_d, _h, mut peer) = serve(routes, DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "custom"})).await;
        let err = peer.recv_response().await.into_result().unwrap_err();
        assert_eq!(err.code, -32001);
        assert_eq!(err.message, "document closed");
    }

    #[tokio::test]
    async fn notifications_are_never_answered() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut routes = ping_routes();
        let flag = Arc::clone(&ran);
        routes.route(
            "note",
            handler_fn(move |_, _| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Err(RpcError::internal("ignored"))
                }
            }),
        );
        let (_d, _h, mut peer) = serve(routes, DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "method": "note"})).await;
        peer.send(json!({"jsonrpc": "2.0", "method": "unknown"})).await;
        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::Number(2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn undecodable_input_is_dropped() {
        let (_d, h, mut peer) = serve(ping_routes(), DispatcherConfig::default());
        peer.sink.send(bytes::Bytes::from_static(b"{oops")).await.unwrap();
        peer.send(json!({"jsonrpc": "2.0", "id": 1})).await;
        peer.send(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})).await;
        assert_eq!(peer.recv_response().await.id, RequestId::Number(3));
        assert!(!h.is_closed());
    }

    // ── Cancellation ────────────────────────────────────────────────

    fn blocking_routes(started: Arc<Notify>) -> RouteTable {
        let mut routes = ping_routes();
        routes.route(
            "block",
            handler_fn(move |_, _| {
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    std::future::pending::<()>().await;
                    Ok(json!("late"))
                }
            }),
        );
        routes
    }

    #[tokio::test]
    async fn cancel_running_request_answers_once() {
        let started = Arc::new(Notify::new());
        let (d, h, mut peer) = serve(blocking_routes(Arc::clone(&started)), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 5, "method": "block"})).await;
        started.notified().await;
        assert!(d.inflight().contains(h.id(), &RequestId::Number(5)));

        peer.send(json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": 5}})).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::Number(5));
        assert_eq!(resp.into_result().unwrap_err(), ErrorObject::cancelled());

        peer.send(json!({"jsonrpc": "2.0", "id": 6, "method": "ping"})).await;
        assert_eq!(peer.recv_response().await.id, RequestId::Number(6));
        assert_eq!(d.inflight().connection_len(h.id()), 0);
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_silent() {
        let (_d, _h, mut peer) = serve(ping_routes(), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": 77}})).await;
        peer.send(json!({"jsonrpc": "2.0", "method": "$/cancelRequest"})).await;
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
        assert_eq!(peer.recv_response().await.id, RequestId::Number(1));
    }

    #[tokio::test]
    async fn duplicate_inflight_id_rejected() {
        let started = Arc::new(Notify::new());
        let (_d, _h, mut peer) = serve(blocking_routes(Arc::clone(&started)), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "block"})).await;
        started.notified().await;
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
        let err = peer.recv_response().await.into_result().unwrap_err();
        assert_eq!(err.code, codes::INVALID_REQUEST);
        assert_eq!(err.message, "duplicate request id");
    }

    #[tokio::test]
    async fn handler_timeout_becomes_internal_error() {
        let started = Arc::new(Notify::new());
        let config = DispatcherConfig {
            handler_timeout: Some(Duration::from_millis(30)),
            ..DispatcherConfig::default()
        };
        let (d, h, mut peer) = serve(blocking_routes(started), config);
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "block"})).await;
        let err = peer.recv_response().await.into_result().unwrap_err();
        assert_eq!(err, ErrorObject::internal());
        assert_eq!(d.inflight().connection_len(h.id()), 0);
    }

    // ── Sessions ────────────────────────────────────────────────────

    #[tokio::test]
    async fn session_attributes_survive_between_requests() {
        let mut routes = RouteTable::new();
        routes.route(
            "count",
            handler_fn(|_, ctx: RequestContext| async move {
                let n = ctx.session().attribute("n").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                let _ = ctx.session().set_attribute("n", json!(n));
                Ok(json!(n))
            }),
        );
        let (_d, _h, mut peer) = serve(routes, DispatcherConfig::default());
        for expected in 1..=3 {
            peer.send(json!({"jsonrpc": "2.0", "id": expected, "method": "count"})).await;
            assert_eq!(peer.recv_response().await.into_result().unwrap(), json!(expected));
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn close_cancels_inflight_and_ends_stream() {
        let started = Arc::new(Notify::new());
        let (d, h, mut peer) = serve(blocking_routes(Arc::clone(&started)), DispatcherConfig::default());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "block"})).await;
        started.notified().await;

        h.close();
        tokio::time::timeout(Duration::from_secs(5), h.closed()).await.unwrap();
        assert!(h.is_closed());
        assert_eq!(d.inflight().connection_len(h.id()), 0);
        assert!(h.peer().pending().is_closed());
        assert!(peer.source.next().await.is_none());
    }

    #[tokio::test]
    async fn peer_hangup_closes_connection() {
        let (_d, h, peer) = serve(ping_routes(), DispatcherConfig::default());
        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), h.closed()).await.unwrap();
    }

    #[test]
    fn cancel_target_parsing() {
        assert_eq!(cancel_target(Some(&json!({"id": 4}))), Some(RequestId::Number(4)));
        assert_eq!(cancel_target(Some(&json!({"id": "x"}))), Some(RequestId::from("x")));
        assert_eq!(cancel_target(Some(&json!({"id": true}))), None);
        assert_eq!(cancel_target(Some(&json!([]))), None);
        assert_eq!(cancel_target(None), None);
    }
}
