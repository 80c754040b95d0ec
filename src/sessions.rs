//! Live control sessions, grouped by the token they logged in with.
//!
//! Each session gets a cancellation token its connection task selects on.
//! Invalidating a token cancels every session that authenticated with it,
//! which is how a revoked or disabled token tears down tunnels that are
//! already up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::TOKEN_META_KEY;
use crate::protocol::Login;
use crate::tokens::{redact, InvalidationCallback, TokenStore};

/// Registration of one control session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    id: u64,
    run_id: String,
    token: String,
}

impl SessionHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session has been closed by token invalidation.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

struct Session {
    cancel: CancellationToken,
    id: u64,
}

/// Sessions of one token, keyed by run id
type RunMap = HashMap<String, Session>;

#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, RunMap>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunMap>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a session. Re-registering a run id replaces (and closes) the
    /// previous session with that id.
    pub fn register(&self, token: &str, run_id: &str) -> SessionHandle {
        let cancel = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self.lock().entry(token.to_string()).or_default().insert(
            run_id.to_string(),
            Session {
                cancel: cancel.clone(),
                id,
            },
        );
        if let Some(previous) = replaced {
            previous.cancel.cancel();
        }

        debug!(token = %redact(token), run_id = %run_id, "Session registered");
        SessionHandle {
            cancel,
            id,
            run_id: run_id.to_string(),
            token: token.to_string(),
        }
    }

    /// Track a session for a verified login, using the token the verifier
    /// recorded in its metadata.
    pub fn register_login(&self, login: &Login, run_id: &str) -> Option<SessionHandle> {
        let token = login.meta(TOKEN_META_KEY)?;
        Some(self.register(token, run_id))
    }

    /// Like [`register_login`](Self::register_login), then re-checks the
    /// token against `store`. A token invalidated between verification and
    /// registration has already fired its callback, so the session is
    /// closed here instead and `None` is returned.
    pub fn register_verified_login(
        &self,
        store: &TokenStore,
        login: &Login,
        run_id: &str,
    ) -> Option<SessionHandle> {
        let handle = self.register_login(login, run_id)?;
        if store.get_token(&handle.token).is_none() {
            debug!(token = %redact(&handle.token), run_id = %run_id, "Token revoked during login");
            handle.cancel.cancel();
            self.unregister(&handle);
            return None;
        }
        Some(handle)
    }

    /// Forget a session that ended on its own. A handle that was replaced
    /// by a newer registration of the same run id leaves the newer one in
    /// place.
    pub fn unregister(&self, handle: &SessionHandle) {
        let mut sessions = self.lock();
        if let Some(runs) = sessions.get_mut(&handle.token) {
            if runs.get(&handle.run_id).is_some_and(|s| s.id == handle.id) {
                runs.remove(&handle.run_id);
            }
            if runs.is_empty() {
                sessions.remove(&handle.token);
            }
        }
    }

    /// Close every session authenticated with `token`.
    pub fn close_token(&self, token: &str) -> usize {
        let Some(runs) = self.lock().remove(token) else {
            return 0;
        };
        for session in runs.values() {
            session.cancel.cancel();
        }
        info!(token = %redact(token), sessions = runs.len(), "Closed sessions for invalidated token");
        runs.len()
    }

    pub fn sessions_for(&self, token: &str) -> usize {
        self.lock().get(token).map_or(0, HashMap::len)
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callback for `TokenStore::set_token_invalid_callback` that closes
    /// the token's sessions.
    pub fn invalidation_callback(self: &Arc<Self>) -> InvalidationCallback {
        let registry = Arc::clone(self);
        Arc::new(move |token: String| {
            registry.close_token(&token);
        })
    }
}
