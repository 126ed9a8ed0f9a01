//! Document state machine: lifecycle, roster, and OT integration.
//!
//! ```text
//!            first join                 load completes
//! (created) ───────────► Loading ─────────────────────► Ready
//!                           │  joins queue in arrival      │ operation / selection /
//!                           │  order, one load in flight   │ leave / get-clients
//!                           │                              │
//!                           │ load fails: stays Loading    │ last leave
//!                           ▼                              ▼
//!                      (joiners wait)                  Draining ── save resolves ──► evicted
//! ```
//!
//! The document owns the roster of connections viewing it and the OT
//! engine once loaded. It never touches session-owned `Client` records;
//! presence data reaches it as pre-serialized [`ClientView`]s. All methods
//! are synchronous — the session actor calls them one event at a time, so
//! there is no locking here.

use std::collections::VecDeque;

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde_json::Value;

use crate::client::ClientView;
use crate::ot::OtEngine;
use crate::protocol::{RawOperation, ServerMessage};
use crate::session::{ConnectionHandle, ConnectionId};
use crate::store::StoreError;

struct RosterEntry {
    handle: ConnectionHandle,
    client_id: String,
}

enum DocState {
    /// Load request in flight; `pending` holds connections awaiting init.
    Loading { pending: VecDeque<ConnectionId> },
    /// Steady state: the engine owns the authoritative text.
    Ready { engine: Box<dyn OtEngine> },
    /// Roster emptied; teardown save in flight, eviction pending.
    Draining,
}

/// What a `leave` did to the roster.
pub enum LeaveOutcome {
    /// Other connections remain; a `client-left` was broadcast.
    Remaining,
    /// The roster emptied. `text` is the content to save before eviction,
    /// or `None` when the document never finished loading.
    Empty { text: Option<String> },
}

/// One collaboratively edited document's authoritative state.
pub struct Document {
    doc_id: String,
    session_id: String,
    epoch: u64,
    save_every: u64,
    roster: IndexMap<ConnectionId, RosterEntry>,
    state: DocState,
}

impl Document {
    /// Create the document in Loading state. The caller (session) issues
    /// exactly one load request alongside this; that coalescing is what
    /// keeps racing joins from double-loading.
    pub fn new(doc_id: &str, session_id: &str, epoch: u64, save_every: u64) -> Self {
        debug!("document {doc_id} created in session {session_id} (epoch {epoch})");
        Self {
            doc_id: doc_id.to_string(),
            session_id: session_id.to_string(),
            epoch,
            save_every,
            roster: IndexMap::new(),
            state: DocState::Loading {
                pending: VecDeque::new(),
            },
        }
    }

    /// Generation counter; stale load/save completions carry an older one.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, DocState::Loading { .. })
    }

    pub fn is_draining(&self) -> bool {
        matches!(self.state, DocState::Draining)
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    /// Current revision, once loaded.
    pub fn revision(&self) -> Option<u64> {
        match &self.state {
            DocState::Ready { engine } => Some(engine.revision()),
            _ => None,
        }
    }

    /// Current authoritative text, once loaded.
    pub fn text(&self) -> Option<&str> {
        match &self.state {
            DocState::Ready { engine } => Some(engine.text()),
            _ => None,
        }
    }

    /// Add a connection to the roster, announce it to existing members,
    /// and send (or queue) the init snapshot. Idempotent per connection.
    pub fn join(
        &mut self,
        handle: ConnectionHandle,
        client_id: &str,
        view: ClientView,
        roster_views: &[ClientView],
    ) {
        if self.roster.contains_key(&handle.id) {
            debug!("connection {} already in {}", handle.id, self.doc_id);
            return;
        }

        let announce = ServerMessage::ClientJoined {
            client_id: view.client_id,
            name: view.name,
            color: view.color,
        };
        self.broadcast(None, &announce, false);

        let conn = handle.id;
        self.roster.insert(
            conn,
            RosterEntry {
                handle,
                client_id: client_id.to_string(),
            },
        );
        info!(
            "client {client_id} joined {} ({} connection(s))",
            self.doc_id,
            self.roster.len()
        );

        match &mut self.state {
            DocState::Loading { pending } => {
                pending.push_back(conn);
                debug!("init for connection {conn} queued until {} loads", self.doc_id);
            }
            DocState::Ready { .. } => self.send_init(conn, roster_views),
            // The session replaces a draining document before forwarding a
            // join, so this arm is unreachable in practice.
            DocState::Draining => {
                warn!("join forwarded to draining document {}", self.doc_id)
            }
        }
    }

    /// Loading → Ready. Flushes queued joiners in arrival order; every one
    /// of them sees the same snapshot.
    pub fn load_finished(&mut self, engine: Box<dyn OtEngine>, roster_views: &[ClientView]) {
        let pending = match &mut self.state {
            DocState::Loading { pending } => std::mem::take(pending),
            _ => {
                warn!("load completed for {} but it is not loading", self.doc_id);
                return;
            }
        };
        self.state = DocState::Ready { engine };
        info!(
            "document {} ready, flushing {} queued joiner(s)",
            self.doc_id,
            pending.len()
        );
        for conn in pending {
            self.send_init(conn, roster_views);
        }
    }

    /// A failed load leaves the document in Loading with joiners queued.
    /// No retry policy exists; the gap is inherited from the original
    /// behavior and logged loudly.
    pub fn load_failed(&mut self, err: &StoreError) {
        warn!(
            "load of {} (session {}) failed: {err}; joiners stay queued",
            self.doc_id, self.session_id
        );
    }

    /// Remove a connection from the roster (and the pending queue when
    /// still loading).
    pub fn leave(&mut self, conn: ConnectionId) -> LeaveOutcome {
        let Some(entry) = self.roster.swap_remove(&conn) else {
            return LeaveOutcome::Remaining;
        };
        if let DocState::Loading { pending } = &mut self.state {
            pending.retain(|c| *c != conn);
        }

        if self.roster.is_empty() {
            let text = match std::mem::replace(&mut self.state, DocState::Draining) {
                DocState::Ready { engine } => Some(engine.text().to_string()),
                _ => None,
            };
            info!(
                "last connection left {}; {}",
                self.doc_id,
                if text.is_some() {
                    "saving before eviction"
                } else {
                    "discarding unloaded document"
                }
            );
            return LeaveOutcome::Empty { text };
        }

        self.broadcast(
            None,
            &ServerMessage::ClientLeft {
                client_id: entry.client_id,
            },
            true,
        );
        LeaveOutcome::Remaining
    }

    /// Validate and apply an operation. On success the submitter is acked
    /// before the transformed operation is broadcast to the rest of the
    /// roster. Returns the text to checkpoint when the new revision hits
    /// the save interval.
    ///
    /// On a conflict the whole roster is resynced with a fresh init and
    /// the revision is left unchanged — the document's sole
    /// corruption-recovery mechanism.
    pub fn apply_operation(
        &mut self,
        conn: ConnectionId,
        client_id: &str,
        operation: RawOperation,
        revision: u64,
        roster_views: &[ClientView],
    ) -> Option<String> {
        let result = match &mut self.state {
            DocState::Ready { engine } => engine.receive_operation(revision, operation),
            _ => {
                warn!(
                    "operation on {} dropped: document not ready",
                    self.doc_id
                );
                return None;
            }
        };

        match result {
            Ok(transformed) => {
                if let Some(entry) = self.roster.get(&conn) {
                    entry.handle.send(ServerMessage::Ack {
                        doc: self.doc_id.clone(),
                    });
                }
                let relay = ServerMessage::Operation {
                    doc: self.doc_id.clone(),
                    client_id: client_id.to_string(),
                    operation: transformed,
                    revision,
                };
                self.broadcast(Some(conn), &relay, false);

                let DocState::Ready { engine } = &self.state else {
                    return None;
                };
                let new_revision = engine.revision();
                debug!("document {} advanced to revision {new_revision}", self.doc_id);
                (new_revision % self.save_every == 0).then(|| engine.text().to_string())
            }
            Err(err) => {
                warn!(
                    "operation on {} rejected ({err}); resyncing {} connection(s)",
                    self.doc_id,
                    self.roster.len()
                );
                let conns: Vec<ConnectionId> = self.roster.keys().copied().collect();
                for c in conns {
                    self.send_init(c, roster_views);
                }
                None
            }
        }
    }

    /// Relay a cursor/selection update to the rest of the roster.
    pub fn selection(&self, conn: ConnectionId, client_id: &str, selection: Value) {
        let relay = ServerMessage::Selection {
            doc: self.doc_id.clone(),
            client_id: client_id.to_string(),
            selection,
        };
        self.broadcast(Some(conn), &relay, false);
    }

    /// Broadcast an already-confirmed presence change to the roster.
    /// The session owns the `Client` record and has already decided that
    /// something actually changed.
    pub fn update_presence(&self, origin: ConnectionId, view: &ClientView) {
        let msg = ServerMessage::ClientUpdated {
            client_id: view.client_id.clone(),
            name: view.name.clone(),
            color: view.color.clone(),
            location: view.location.clone(),
        };
        self.broadcast(Some(origin), &msg, false);
    }

    /// Send a payload to every roster connection except the origin unless
    /// explicitly included.
    pub fn broadcast(&self, origin: Option<ConnectionId>, msg: &ServerMessage, include_origin: bool) {
        for (conn, entry) in &self.roster {
            if Some(*conn) == origin && !include_origin {
                continue;
            }
            entry.handle.send(msg.clone());
        }
    }

    fn send_init(&self, conn: ConnectionId, roster_views: &[ClientView]) {
        let DocState::Ready { engine } = &self.state else {
            return;
        };
        let Some(entry) = self.roster.get(&conn) else {
            return;
        };
        entry.handle.send(ServerMessage::InitDocument {
            operation: engine.snapshot(),
            revision: engine.revision(),
            doc: self.doc_id.clone(),
            clients: roster_views.to_vec(),
        });
    }
}
