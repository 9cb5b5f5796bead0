//! Built-in diagnostic methods.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_rpc::{RequestContext, RouteTable, RpcError, typed_handler};

/// Liveness probe; answers `"pong"`.
pub const PING: &str = "tether/ping";
/// Lists every method name with an explicit route.
pub const METHODS: &str = "tether/methods";
/// Reads, and optionally updates, the caller's session.
pub const SESSION: &str = "tether/session";

/// Params for [`SESSION`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// Attributes to set before reporting. A `null` value removes the
    /// attribute.
    pub set: Map<String, Value>,
}

/// Result of [`SESSION`].
#[derive(Debug, Serialize)]
pub struct SessionReport {
    /// Session id.
    pub id: String,
    /// Current attributes.
    pub attributes: Map<String, Value>,
    /// Whether the session will be stored after this exchange.
    pub started: bool,
}

/// Register the built-in methods on `routes`.
pub fn register_builtin(routes: &mut RouteTable) {
    routes.route(
        PING,
        typed_handler(|(): (), _ctx: RequestContext| async { Ok::<_, RpcError>("pong") }),
    );
    routes.route(
        METHODS,
        typed_handler(|(): (), ctx: RequestContext| async move {
            Ok::<_, RpcError>(ctx.routes().methods())
        }),
    );
    routes.route(
        SESSION,
        typed_handler(|params: Option<SessionParams>, ctx: RequestContext| async move {
            let session = ctx.session();
            for (name, value) in params.unwrap_or_default().set {
                if value.is_null() {
                    let _ = session.remove_attribute(&name);
                } else {
                    let _ = session.set_attribute(name, value);
                }
            }
            let attributes: Map<String, Value> = session.attributes().into_iter().collect();
            Ok::<_, RpcError>(SessionReport {
                id: session.id().to_string(),
                attributes,
                started: session.is_started(),
            })
        }),
    );
}
