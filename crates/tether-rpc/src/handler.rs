//! Method handlers and their per-call context.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::{ConnectionId, RequestId, SessionId};
use tokio_util::sync::CancellationToken;

use crate::client::PeerClient;
use crate::errors::RpcError;
use crate::routing::RouteTable;
use crate::session::Session;

/// Trait implemented by every method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params and context.
    async fn handle(&self, params: Option<Value>, ctx: &RequestContext) -> Result<Value, RpcError>;
}

/// Everything a handler may need besides its params.
#[derive(Clone)]
pub struct RequestContext {
    connection_id: ConnectionId,
    request_id: Option<RequestId>,
    method: String,
    cancellation: CancellationToken,
    session: Arc<Session>,
    peer: PeerClient,
    routes: Arc<RouteTable>,
}

impl RequestContext {
    pub(crate) fn new(
        connection_id: ConnectionId,
        request_id: Option<RequestId>,
        method: String,
        cancellation: CancellationToken,
        session: Arc<Session>,
        peer: PeerClient,
        routes: Arc<RouteTable>,
    ) -> Self {
        Self {
            connection_id,
            request_id,
            method,
            cancellation,
            session,
            peer,
            routes,
        }
    }

    /// Context not bound to any connection, for calling handlers directly.
    /// Its peer client fails every exchange with `ConnectionClosed`.
    pub fn detached(method: &str) -> Self {
        let connection_id = ConnectionId::new();
        Self {
            session: Arc::new(Session::new(SessionId::from(&connection_id))),
            peer: PeerClient::detached(connection_id.clone()),
            connection_id,
            request_id: None,
            method: method.to_owned(),
            cancellation: CancellationToken::new(),
            routes: Arc::new(RouteTable::new()),
        }
    }

    /// Connection the call arrived on.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Request id; `None` for notifications.
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Method being handled.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether the call is a notification.
    pub fn is_notification(&self) -> bool {
        self.request_id.is_none()
    }

    /// Fired when the peer cancels this request or the connection closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Session resolved for this exchange.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Client for calling back into the peer on the same connection.
    pub fn peer(&self) -> &PeerClient {
        &self.peer
    }

    /// The route table serving this connection.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Closure adapters
// ─────────────────────────────────────────────────────────────────────────────

/// Handler built from an async closure over raw params.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure `(params, ctx) -> Result<Value, RpcError>` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, ctx: &RequestContext) -> Result<Value, RpcError> {
        (self.f)(params, ctx.clone()).await
    }
}

/// Handler whose params and result are typed.
pub struct TypedHandler<F, P, R> {
    f: F,
    _types: PhantomData<fn(P) -> R>,
}

/// Wrap an async closure `(P, ctx) -> Result<R, RpcError>` as a handler.
///
/// Params are deserialized into `P` (missing params deserialize from `null`,
/// so `()` and `Option<_>` accept them); a mismatch is
/// [`RpcError::InvalidParams`]. The result is serialized from `R`.
pub fn typed_handler<P, R, F, Fut>(f: F) -> TypedHandler<F, P, R>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<F, P, R, Fut> MethodHandler for TypedHandler<F, P, R>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, ctx: &RequestContext) -> Result<Value, RpcError> {
        let typed: P = serde_json::from_value(params.unwrap_or(Value::Null))?;
        let result = (self.f)(typed, ctx.clone()).await?;
        serde_json::to_value(result)
            .map_err(|e| RpcError::internal(format!("failed to serialize result: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Greet {
        name: String,
    }

    #[derive(Serialize)]
    struct Greeting {
        hello: String,
    }

    #[tokio::test]
    async fn handler_fn_receives_params_and_context() {
        let h = handler_fn(|params, ctx: RequestContext| async move {
            Ok(json!({ "method": ctx.method(), "params": params }))
        });
        let ctx = RequestContext::detached("echo");
        let out = h.handle(Some(json!([1, 2])), &ctx).await.unwrap();
        assert_eq!(out["method"], "echo");
        assert_eq!(out["params"], json!([1, 2]));
    }

    #[tokio::test]
    async fn typed_handler_round_trip() {
        let h = typed_handler(|p: Greet, _ctx| async move {
            Ok(Greeting {
                hello: p.name,
            })
        });
        let ctx = RequestContext::detached("greet");
        let out = h.handle(Some(json!({"name": "ada"})), &ctx).await.unwrap();
        assert_eq!(out, json!({"hello": "ada"}));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_params() {
        let h = typed_handler(|p: Greet, _ctx| async move { Ok(p.name) });
        let ctx = RequestContext::detached("greet");
        let err = h.handle(Some(json!({"nom": 1})), &ctx).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidParams { .. });
    }

    #[tokio::test]
    async fn typed_handler_unit_params_accept_missing() {
        let h = typed_handler(|(): (), _ctx| async move { Ok("pong") });
        let ctx = RequestContext::detached("ping");
        assert_eq!(h.handle(None, &ctx).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn typed_handler_propagates_handler_error() {
        let h = typed_handler(|(): (), _ctx| async move {
            Err::<Value, _>(RpcError::custom(-32001, "nope"))
        });
        let err = h
            .handle(None, &RequestContext::detached("x"))
            .await
            .unwrap_err();
        assert_matches!(err, RpcError::Custom { code: -32001, .. });
    }

    #[test]
    fn detached_context_shape() {
        let ctx = RequestContext::detached("m");
        assert!(ctx.is_notification());
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.session().id().as_str(), ctx.connection_id().as_str());
        assert!(ctx.routes().is_empty());
    }
}
