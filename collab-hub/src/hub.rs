//! Hub: the owned registry of live session actors.
//!
//! ```text
//! gateway ── Hub::session("room-1") ──► SessionHandle ── events ──► task
//! ```
//!
//! The hub is plain injected state, shared behind an `Arc` by whoever
//! accepts connections. Each session runs as its own task and ends once
//! its last peer leaves and its last teardown save resolves; the registry
//! notices the closed channel on the next lookup and starts a fresh actor
//! for the same id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::info;
use tokio::sync::mpsc;

use crate::config::HubConfig;
use crate::ot::OtEngineFactory;
use crate::session::{ConnectionId, Session, SessionEvent};
use crate::store::FileStore;

/// Cheap cloneable handle for feeding events to one session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn send(&self, event: SessionEvent) {
        // A closed channel means the session already ended; the sender's
        // connection is about to observe that anyway.
        let _ = self.events.send(event);
    }

    /// Send, returning the event when the session has already ended so
    /// the caller can re-deliver it to a fresh session. Registrations go
    /// through this; losing one would strand an authenticated connection.
    pub fn try_send(&self, event: SessionEvent) -> Result<(), SessionEvent> {
        self.events.send(event).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Registry of live sessions plus the collaborators they share.
pub struct Hub {
    config: HubConfig,
    store: Arc<dyn FileStore>,
    engines: Arc<dyn OtEngineFactory>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_conn: AtomicU64,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        store: Arc<dyn FileStore>,
        engines: Arc<dyn OtEngineFactory>,
    ) -> Self {
        Self {
            config,
            store,
            engines,
            sessions: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Allocate a process-unique connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the session for `session_id`, starting its actor task if it is
    /// not running. A finished session's stale handle is replaced here.
    pub fn session(&self, session_id: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sessions.get(session_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            session_id,
            self.store.clone(),
            self.engines.clone(),
            self.config.save_every,
            tx.clone(),
        );
        tokio::spawn(session.run(rx));
        info!("session {session_id} spawned");

        let handle = SessionHandle { events: tx };
        sessions.insert(session_id.to_string(), handle.clone());
        handle
    }

    /// Count of sessions whose actor is still running.
    pub fn session_count(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, handle| !handle.is_closed());
        sessions.len()
    }
}
