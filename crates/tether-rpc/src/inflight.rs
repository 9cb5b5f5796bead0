//! Registry of inbound requests that are currently executing.
//!
//! Keyed by `(connection, request id)`. Each entry carries the request's
//! cancellation token and a shared "resolved" flag. Whoever flips the flag
//! first (the handler finishing, or a `$/cancelRequest`) owns the single
//! response for that id; the other side writes nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tether_core::{ConnectionId, RequestId};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Key = (ConnectionId, RequestId);

struct Entry {
    token: CancellationToken,
    resolved: Arc<AtomicBool>,
}

/// Handle held by the task running a request.
#[derive(Debug)]
pub struct InFlightTicket {
    connection_id: ConnectionId,
    request_id: RequestId,
    token: CancellationToken,
    resolved: Arc<AtomicBool>,
}

impl InFlightTicket {
    /// Connection the request arrived on.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Id of the request.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The request's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Claim the right to respond. Returns `true` exactly once across this
    /// ticket and any racing [`InFlightRegistry::cancel`].
    pub fn try_resolve(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }
}

/// Shared registry of executing requests.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl InFlightRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request as executing. `None` when the id is already in
    /// flight on this connection.
    pub fn begin(
        &self,
        connection_id: &ConnectionId,
        request_id: &RequestId,
        token: CancellationToken,
    ) -> Option<InFlightTicket> {
        let key = (connection_id.clone(), request_id.clone());
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return None;
        }
        let resolved = Arc::new(AtomicBool::new(false));
        let _ = entries.insert(
            key,
            Entry {
                token: token.clone(),
                resolved: Arc::clone(&resolved),
            },
        );
        Some(InFlightTicket {
            connection_id: connection_id.clone(),
            request_id: request_id.clone(),
            token,
            resolved,
        })
    }

    /// Cancel a request. Returns `true` when the request was still running
    /// and this call won the right to answer it.
    pub fn cancel(&self, connection_id: &ConnectionId, request_id: &RequestId) -> bool {
        let entry = self
            .entries
            .lock()
            .remove(&(connection_id.clone(), request_id.clone()));
        let Some(entry) = entry else {
            return false;
        };
        if entry.resolved.swap(true, Ordering::AcqRel) {
            debug!(%request_id, "cancel lost the race to completion");
            return false;
        }
        entry.token.cancel();
        true
    }

    /// Remove an entry by key. Returns whether it was present.
    pub fn end(&self, connection_id: &ConnectionId, request_id: &RequestId) -> bool {
        self.entries
            .lock()
            .remove(&(connection_id.clone(), request_id.clone()))
            .is_some()
    }

    /// Remove the entry owned by `ticket`, leaving alone any newer request
    /// that reused the id after a cancellation.
    pub fn release(&self, ticket: &InFlightTicket) -> bool {
        let key = (ticket.connection_id.clone(), ticket.request_id.clone());
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.resolved, &ticket.resolved) => {
                let _ = entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Cancel and remove every request of a connection. Returns how many
    /// entries were removed.
    pub fn cancel_connection(&self, connection_id: &ConnectionId) -> usize {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<Key> = entries
                .keys()
                .filter(|(conn, _)| conn == connection_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        for entry in &removed {
            entry.resolved.store(true, Ordering::Release);
            entry.token.cancel();
        }
        removed.len()
    }

    /// Number of executing requests across all connections.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is executing.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `(connection, id)` is executing.
    pub fn contains(&self, connection_id: &ConnectionId, request_id: &RequestId) -> bool {
        self.entries
            .lock()
            .contains_key(&(connection_id.clone(), request_id.clone()))
    }

    /// Number of executing requests on one connection.
    pub fn connection_len(&self, connection_id: &ConnectionId) -> usize {
        self.entries
            .lock()
            .keys()
            .filter(|(conn, _)| conn == connection_id)
            .count()
    }
}
