//! Per-exchange session resolution and the response commit lifecycle.
//!
//! Every inbound call is an [`Exchange`]. The [`SessionManager`] finds (or
//! lazily creates) the session for it via a [`SessionIdResolver`] and a
//! [`SessionStore`], and arranges for the session to be saved right before
//! the exchange's response is committed to the wire.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tether_core::{ConnectionId, RequestId, SessionId};
use tracing::debug;

use crate::errors::SessionError;

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by all exchanges of one session.
pub struct Session {
    id: SessionId,
    attributes: RwLock<HashMap<String, Value>>,
    started: AtomicBool,
    expired: AtomicBool,
    created_at: DateTime<Utc>,
    last_accessed: Mutex<DateTime<Utc>>,
}

impl Session {
    /// Fresh, unstarted session.
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            attributes: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            created_at: now,
            last_accessed: Mutex::new(now),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Read one attribute.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.read().get(name).cloned()
    }

    /// Set an attribute. A session with attributes counts as started.
    pub fn set_attribute(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.write().insert(name.into(), value)
    }

    /// Remove an attribute.
    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.write().remove(name)
    }

    /// Snapshot of all attributes.
    pub fn attributes(&self) -> HashMap<String, Value> {
        self.attributes.read().clone()
    }

    /// Mark the session as started even without attributes.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Explicitly started, or holding at least one attribute.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) || !self.attributes.read().is_empty()
    }

    /// Invalidate the session; it will not be saved again.
    pub fn invalidate(&self) {
        self.expired.store(true, Ordering::Release);
    }

    /// Whether the session was invalidated or timed out.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last time the session was retrieved or saved.
    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock()
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_accessed.lock() = now;
    }

    fn idle_longer_than(&self, max_idle: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_accessed());
        idle.to_std().is_ok_and(|idle| idle > max_idle)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("started", &self.is_started())
            .field("expired", &self.is_expired())
            .field("attributes", &self.attributes.read().len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a live session.
    async fn retrieve(&self, id: &SessionId) -> Result<Option<Arc<Session>>, SessionError>;

    /// Create a new session. It is not stored until saved.
    async fn create(&self, id: SessionId) -> Result<Arc<Session>, SessionError>;

    /// Persist a session.
    async fn save(&self, session: &Arc<Session>) -> Result<(), SessionError>;

    /// Delete a session.
    async fn remove(&self, id: &SessionId) -> Result<(), SessionError>;
}

/// Process-local store. Sessions idle for longer than `max_idle` are
/// expired and evicted on lookup.
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Arc<Session>>,
    max_idle: Duration,
}

impl InMemorySessionStore {
    /// Default idle limit (30 minutes).
    pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(1800);

    /// Store with the given idle limit.
    pub fn new(max_idle: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_idle,
        }
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every stored session idle past the limit. Returns how many.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let keep = !session.is_expired() && !session.idle_longer_than(self.max_idle, now);
            if !keep {
                session.invalidate();
            }
            keep
        });
        before - self.sessions.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_IDLE)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn retrieve(&self, id: &SessionId) -> Result<Option<Arc<Session>>, SessionError> {
        let Some(session) = self.sessions.get(id).map(|s| Arc::clone(&s)) else {
            return Ok(None);
        };
        let now = Utc::now();
        if session.is_expired() || session.idle_longer_than(self.max_idle, now) {
            debug!(session_id = %id, "session expired, evicting");
            session.invalidate();
            let _ = self.sessions.remove(id);
            return Ok(None);
        }
        session.touch(now);
        Ok(Some(session))
    }

    async fn create(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        Ok(Arc::new(Session::new(id)))
    }

    async fn save(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        if session.is_expired() {
            return Err(SessionError::Expired(session.id().clone()));
        }
        session.touch(Utc::now());
        let _ = self
            .sessions
            .insert(session.id().clone(), Arc::clone(session));
        Ok(())
    }

    async fn remove(&self, id: &SessionId) -> Result<(), SessionError> {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.invalidate();
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commit lifecycle
// ─────────────────────────────────────────────────────────────────────────────

// Runs right before a response is committed.
type CommitHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), SessionError>> + Send>;

/// Where a response is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    /// Hooks may still be added.
    New,
    /// Hooks are running.
    Committing,
    /// The response may be written.
    Committed,
}

const STATE_NEW: u8 = 0;
const STATE_COMMITTING: u8 = 1;
const STATE_COMMITTED: u8 = 2;

/// `New → Committing → Committed`, with before-commit hooks run once.
#[derive(Default)]
pub struct ResponseCommit {
    state: AtomicU8,
    hooks: Mutex<Vec<CommitHook>>,
}

impl ResponseCommit {
    /// Fresh lifecycle in the `New` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a hook. Returns `false` (and drops the hook) once committing
    /// has begun.
    pub fn before_commit<F, Fut>(&self, hook: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        let mut hooks = self.hooks.lock();
        if self.state.load(Ordering::Acquire) != STATE_NEW {
            return false;
        }
        hooks.push(Box::new(move || -> BoxFuture<'static, Result<(), SessionError>> {
            Box::pin(hook())
        }));
        true
    }

    /// Run the queued hooks in order and move to `Committed`. Only the
    /// first call does anything; a failing hook stops the chain and its
    /// error is returned.
    pub async fn commit(&self) -> Result<(), SessionError> {
        let hooks = {
            let mut hooks = self.hooks.lock();
            if self
                .state
                .compare_exchange(STATE_NEW, STATE_COMMITTING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }
            std::mem::take(&mut *hooks)
        };
        let mut result = Ok(());
        for hook in hooks {
            if let Err(err) = hook().await {
                result = Err(err);
                break;
            }
        }
        self.state.store(STATE_COMMITTED, Ordering::Release);
        result
    }

    /// Current state.
    pub fn state(&self) -> CommitState {
        match self.state.load(Ordering::Acquire) {
            STATE_NEW => CommitState::New,
            STATE_COMMITTING => CommitState::Committing,
            _ => CommitState::Committed,
        }
    }

    /// Whether [`commit`](Self::commit) has finished.
    pub fn is_committed(&self) -> bool {
        self.state() == CommitState::Committed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exchange and resolution
// ─────────────────────────────────────────────────────────────────────────────

/// One inbound call and its response lifecycle.
pub struct Exchange {
    connection_id: ConnectionId,
    request_id: Option<RequestId>,
    method: String,
    commit: ResponseCommit,
}

impl Exchange {
    /// Exchange for a call on `connection_id`.
    pub fn new(connection_id: ConnectionId, request_id: Option<RequestId>, method: String) -> Self {
        Self {
            connection_id,
            request_id,
            method,
            commit: ResponseCommit::new(),
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

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The response commit lifecycle.
    pub fn commit(&self) -> &ResponseCommit {
        &self.commit
    }
}

/// Maps an exchange to candidate session ids.
#[cfg_attr(test, mockall::automock)]
pub trait SessionIdResolver: Send + Sync {
    /// Ids to try, in order. The first is used when creating a session.
    fn resolve_ids(&self, exchange: &Exchange) -> Vec<SessionId>;
}

/// One session per connection: the session id is the connection id.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionSessionIdResolver;

impl SessionIdResolver for ConnectionSessionIdResolver {
    fn resolve_ids(&self, exchange: &Exchange) -> Vec<SessionId> {
        vec![SessionId::from(exchange.connection_id())]
    }
}

/// Resolves and saves sessions around exchanges.
///
/// Exchanges that overlap in time share one `Session` per id even before
/// the first of them has saved it: every resolved session is registered in
/// a weak map, and a later resolver adopts the registered instance while
/// something still holds it.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    resolver: Arc<dyn SessionIdResolver>,
    live: Arc<DashMap<SessionId, Weak<Session>>>,
}

impl SessionManager {
    /// Manager over `store`, resolving ids with `resolver`.
    pub fn new(store: Arc<dyn SessionStore>, resolver: Arc<dyn SessionIdResolver>) -> Self {
        Self {
            store,
            resolver,
            live: Arc::new(DashMap::new()),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Find or create the exchange's session and schedule its save before
    /// the response commits.
    pub async fn resolve(&self, exchange: &Exchange) -> Result<Arc<Session>, SessionError> {
        let ids = self.resolver.resolve_ids(exchange);
        let mut session = None;
        for id in &ids {
            if let Some(found) = self.store.retrieve(id).await? {
                session = Some(found);
                break;
            }
        }
        let session = match session {
            Some(found) => self.share(found),
            None => {
                self.live.retain(|_, weak| weak.strong_count() > 0);
                let id = ids.into_iter().next().unwrap_or_default();
                let created = self.store.create(id).await?;
                let session = self.share(created);
                debug!(session_id = %session.id(), "resolved fresh session");
                session
            }
        };

        let manager = self.clone();
        let to_save = Arc::clone(&session);
        let _ = exchange
            .commit()
            .before_commit(move || async move { manager.save_if_active(&to_save).await });
        Ok(session)
    }

    /// The live instance for `candidate`'s id, registering `candidate`
    /// when there is none.
    fn share(&self, candidate: Arc<Session>) -> Arc<Session> {
        match self.live.entry(candidate.id().clone()) {
            MapEntry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade().filter(|s| !s.is_expired()) {
                    return existing;
                }
                let _ = entry.insert(Arc::downgrade(&candidate));
                candidate
            }
            MapEntry::Vacant(entry) => {
                let _ = entry.insert(Arc::downgrade(&candidate));
                candidate
            }
        }
    }

    /// Number of ids with a registered live session.
    pub fn live_count(&self) -> usize {
        self.live
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Save the session only when it was started and has not expired.
    pub async fn save_if_active(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        if session.is_started() && !session.is_expired() {
            self.store.save(session).await
        } else {
            Ok(())
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(
            Arc::new(InMemorySessionStore::default()),
            Arc::new(ConnectionSessionIdResolver),
        )
    }
}
