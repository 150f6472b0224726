#![deny(missing_docs)]
//! Session Manager for the relay broker (§4.4): admission, bearer auth, and the
//! session-level node of the cancellation tree (§4.7).
//!
//! The daemon owns exactly one [`SessionManager`], itself rooted at the daemon's
//! own shutdown [`CancellationToken`]. Every [`Session`] is a child of that root, and
//! every Call's own token (constructed by `relay-dispatch`) is a child of its Session —
//! cancelling any node cancels everything beneath it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_types::{BrokerError, SessionId, Transport};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One authenticated client connection and its associated resources (§3).
pub struct Session {
    /// Opaque, process-lifetime-unique identifier.
    pub id: SessionId,
    /// Which transport this session was admitted over.
    pub transport: Transport,
    /// When the session was admitted.
    pub created_at: DateTime<Utc>,
    /// Per-session in-flight call cap, acquired by the scheduler before the provider
    /// and global semaphores (§4.5 step 3).
    pub semaphore: Arc<Semaphore>,
    /// Cancelling this token cancels every Call attributed to this session.
    pub cancellation: CancellationToken,
}

impl Session {
    /// Derive a fresh call-leaf cancellation token, a child of this session's node.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation.child_token()
    }
}

/// Owns the set of live [`Session`]s and admits/destroys them (§4.4).
pub struct SessionManager {
    root: CancellationToken,
    ws_auth_token: Option<String>,
    session_max_inflight: usize,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    /// Create a manager rooted at `root` (the daemon's own shutdown token).
    #[must_use]
    pub fn new(
        root: CancellationToken,
        ws_auth_token: Option<String>,
        session_max_inflight: usize,
    ) -> Self {
        Self {
            root,
            ws_auth_token,
            session_max_inflight,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a new connection.
    ///
    /// stdio credentials are ignored and always admitted. WebSocket credentials must
    /// match the configured `WS_AUTH_TOKEN` exactly (§4.4); if none is configured, any
    /// WebSocket credential (including none) is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AuthError`] if a WebSocket credential doesn't match.
    pub fn admit(
        &self,
        transport: Transport,
        credential: Option<&str>,
    ) -> Result<Arc<Session>, BrokerError> {
        if transport == Transport::Ws {
            relay_auth::verify_bearer(credential, self.ws_auth_token.as_deref())?;
        }

        let session = Arc::new(Session {
            id: SessionId::new(uuid::Uuid::new_v4().to_string()),
            transport,
            created_at: Utc::now(),
            semaphore: Arc::new(Semaphore::new(self.session_max_inflight)),
            cancellation: self.root.child_token(),
        });

        self.sessions
            .lock()
            .expect("session map mutex is never held across a panic")
            .insert(session.id.clone(), session.clone());

        tracing::info!(session_id = %session.id, transport = ?session.transport, "session_opened");
        Ok(session)
    }

    /// Look up a live session by id.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session map mutex is never held across a panic")
            .get(id)
            .cloned()
    }

    /// Tear down a session: idempotent, cancels every Call attributed to it, and
    /// reports whether this call actually destroyed it (vs. finding it already gone),
    /// so callers emit exactly one `session_closed` telemetry event (§4.4).
    pub fn destroy(&self, id: &SessionId, reason: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .expect("session map mutex is never held across a panic")
            .remove(id);

        match removed {
            Some(session) => {
                session.cancellation.cancel();
                tracing::info!(session_id = %id, reason, "session_closed");
                true
            }
            None => false,
        }
    }

    /// Number of currently live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session map mutex is never held across a panic")
            .len()
    }

    /// Whether there are no live sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel the root token, fanning out to every live session and, transitively,
    /// every in-flight Call (§4.7 shutdown).
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}
