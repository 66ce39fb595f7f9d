use crate::encoder::SessionEvent;
use crate::frame::SessionId;
use crate::telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("session {0} is already registered")]
    AlreadyRegistered(SessionId),
    #[error("session {0} is not registered")]
    NotFound(SessionId),
    #[error("connection {token} of session {id} has been replaced")]
    Replaced { id: SessionId, token: u64 },
    #[error("session {id} is {state}")]
    NotOpen { id: SessionId, state: SessionState },
    #[error("outbound queue of session {0} is full")]
    OutboundFull(SessionId),
}

/// One registration of a session id. A client that reconnects under the
/// same id gets a new token, so anything addressed to the old one is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    id: SessionId,
    token: u64,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// What the transport needs to drive a freshly registered session.
pub struct Registration {
    pub handle: SessionHandle,
    /// Outbound FIFO, drained by the session's send loop.
    pub outbound: mpsc::Receiver<String>,
    /// Cancelled when the session starts closing, whoever initiated it.
    pub closing: CancellationToken,
}

struct Session {
    token: u64,
    state: Mutex<SessionState>,
    /// Set once the session has been `Open`, and so announced to the others.
    announced: AtomicBool,
    outbound: mpsc::Sender<String>,
    closing: CancellationToken,
}

impl Session {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }
}

/// Owns the connection registry and every session's lifecycle.
///
/// Other components address sessions only through a [`SessionHandle`]. Locks
/// are never held across an await: lookups clone the session out of the map first.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_token: AtomicU64,
    outbound_capacity: usize,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(outbound_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            outbound_capacity: outbound_capacity.max(1),
            metrics,
        }
    }

    /// Adds a `Connecting` session under a fresh connection token.
    pub fn register(&self, id: SessionId) -> Result<Registration, SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyRegistered(id));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let closing = CancellationToken::new();

        sessions.insert(
            id.clone(),
            Arc::new(Session {
                token,
                state: Mutex::new(SessionState::Connecting),
                announced: AtomicBool::new(false),
                outbound,
                closing: closing.clone(),
            }),
        );
        tracing::debug!(session_id = %id, token, "session registered");

        Ok(Registration {
            handle: SessionHandle { id, token },
            outbound: outbound_rx,
            closing,
        })
    }

    /// `Connecting -> Open`, then announces the new session to the others.
    pub fn open(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let session = self.get(handle)?;
        {
            let mut state = session.state.lock();
            if *state != SessionState::Connecting {
                return Err(SessionError::NotOpen {
                    id: handle.id.clone(),
                    state: *state,
                });
            }
            *state = SessionState::Open;
        }
        session.announced.store(true, Ordering::Release);

        self.metrics.session_opened();
        tracing::info!(session_id = %handle.id, "session open");

        let event = SessionEvent::Joined {
            client_id: handle.id.as_str(),
        };
        self.broadcast_event(&event, Some(&handle.id));

        Ok(())
    }

    /// Queues `message` for the session, waiting for room in its outbound queue.
    ///
    /// Messages for a connection that is not `Open`, or that has been
    /// replaced by a reconnect, are dropped.
    pub async fn send(&self, handle: &SessionHandle, message: String) -> Result<(), SessionError> {
        let session = self.open_session(handle)?;

        session.outbound.send(message).await.map_err(|_| {
            tracing::debug!(session_id = %handle.id, "outbound queue closed, message dropped");
            SessionError::NotOpen {
                id: handle.id.clone(),
                state: session.state(),
            }
        })
    }

    /// Like [`send`](Self::send) but never waits; a full queue drops the message.
    pub fn notify(&self, handle: &SessionHandle, message: String) -> Result<(), SessionError> {
        let session = self.open_session(handle)?;

        session.outbound.try_send(message).map_err(|e| {
            tracing::warn!(session_id = %handle.id, "notification dropped: {}", e);
            match e {
                TrySendError::Full(_) => SessionError::OutboundFull(handle.id.clone()),
                TrySendError::Closed(_) => SessionError::NotOpen {
                    id: handle.id.clone(),
                    state: session.state(),
                },
            }
        })
    }

    /// Queues `message` on every `Open` session and returns how many accepted it.
    pub fn broadcast(&self, message: &str) -> usize {
        self.broadcast_except(message, None)
    }

    /// `Open -> Closing` (or `Connecting -> Closing`) and cancels the
    /// session's closing token.
    ///
    /// Returns false when the connection was already closing, replaced or unknown.
    pub fn begin_close(&self, handle: &SessionHandle) -> bool {
        match self.get(handle) {
            Ok(session) => close_session(&handle.id, &session),
            Err(_) => false,
        }
    }

    /// `Closing -> Closed`: drops the session from the registry and tells
    /// the remaining sessions it left. A newer registration of the same id
    /// is left alone.
    pub fn finish_close(&self, handle: &SessionHandle) {
        let session = {
            let mut sessions = self.sessions.write();
            let current = sessions.get(&handle.id).map(|session| session.token);
            if current == Some(handle.token) {
                sessions.remove(&handle.id)
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };

        *session.state.lock() = SessionState::Closed;
        session.closing.cancel();
        tracing::info!(session_id = %handle.id, "session closed");

        if !session.announced.load(Ordering::Acquire) {
            return;
        }
        self.metrics.session_closed();

        let event = SessionEvent::Left {
            client_id: handle.id.as_str(),
        };
        self.broadcast_event(&event, None);
    }

    /// Moves every live session to `Closing`.
    pub fn shutdown(&self) {
        let sessions: Vec<(SessionId, Arc<Session>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect();
        tracing::info!(sessions = sessions.len(), "closing all sessions");

        for (id, session) in &sessions {
            close_session(id, session);
        }
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.read().get(id).map(|s| s.state())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, handle: &SessionHandle) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .read()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(handle.id.clone()))?;

        if session.token != handle.token {
            return Err(SessionError::Replaced {
                id: handle.id.clone(),
                token: handle.token,
            });
        }

        Ok(session)
    }

    fn open_session(&self, handle: &SessionHandle) -> Result<Arc<Session>, SessionError> {
        let session = self.get(handle).inspect_err(|e| {
            tracing::debug!(session_id = %handle.id, token = handle.token, "message dropped: {}", e);
        })?;

        let state = session.state();
        if state != SessionState::Open {
            tracing::debug!(session_id = %handle.id, %state, "message for inactive session dropped");
            return Err(SessionError::NotOpen {
                id: handle.id.clone(),
                state,
            });
        }

        Ok(session)
    }

    fn broadcast_event(&self, event: &SessionEvent<'_>, except: Option<&SessionId>) {
        match event.to_json() {
            Ok(json) => {
                self.broadcast_except(&json, except);
            }
            Err(e) => tracing::warn!("failed to serialize session event: {}", e),
        }
    }

    fn broadcast_except(&self, message: &str, except: Option<&SessionId>) -> usize {
        let recipients: Vec<(SessionId, Arc<Session>)> = self
            .sessions
            .read()
            .iter()
            .filter(|(id, session)| {
                Some(*id) != except && session.state() == SessionState::Open
            })
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect();

        let mut delivered = 0;
        for (id, session) in recipients {
            match session.outbound.try_send(message.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(session_id = %id, "failed to broadcast to session: {}", e),
            }
        }

        tracing::debug!(delivered, "broadcast sent");
        delivered
    }
}

fn close_session(id: &SessionId, session: &Session) -> bool {
    {
        let mut state = session.state.lock();
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        *state = SessionState::Closing;
    }

    // Independent of the outbound queue, which may be full.
    session.closing.cancel();
    tracing::info!(session_id = %id, "session closing");

    true
}
