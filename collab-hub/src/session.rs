//! Session actor: connected clients, document registry, and routing.
//!
//! ```text
//! gateway ── SessionEvent ──► Session task ──► Document ──► outboxes
//!                                  ▲   │
//!                                  │   └── tokio::spawn(load/save)
//!                                  └────────── LoadFinished / SaveFinished
//! ```
//!
//! One task owns all of a session's state; events are handled to
//! completion one at a time, so roster edits, OT applies, and presence
//! updates never interleave — exclusion is structural, not lock-based.
//! The only suspension points are the spawned store calls, whose
//! completions re-enter the loop as events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::client::{Client, ClientView};
use crate::document::{Document, LeaveOutcome};
use crate::ot::OtEngineFactory;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::store::{FileStore, StoreError};

/// Process-local connection identifier, assigned by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending side of one connection's outbox. Sends never block; a closed
/// peer just drops the message.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbox: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, outbox }
    }

    /// Build a handle together with its receiving half.
    pub fn channel(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    pub fn send(&self, msg: ServerMessage) {
        if self.outbox.send(msg).is_err() {
            debug!("connection {} outbox closed", self.id);
        }
    }
}

/// Why a save was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveCause {
    /// Periodic fire-and-forget checkpoint; failures are only logged.
    Checkpoint,
    /// Last-leave save; eviction waits for its completion.
    Teardown,
}

/// Everything a session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    /// A connection authenticated and registered.
    Connected {
        handle: ConnectionHandle,
        client: Client,
    },
    /// A connection went away.
    Disconnected { conn: ConnectionId },
    /// A parsed post-auth message.
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    /// A spawned load resolved.
    LoadFinished {
        doc: String,
        epoch: u64,
        result: Result<String, StoreError>,
    },
    /// A spawned save resolved.
    SaveFinished {
        doc: String,
        epoch: u64,
        cause: SaveCause,
        result: Result<(), StoreError>,
    },
}

/// Connection bookkeeping, logged when the session ends.
#[derive(Debug)]
pub struct SessionStats {
    pub created: Instant,
    pub connections: u64,
    pub messages: u64,
}

struct Peer {
    handle: ConnectionHandle,
    client: Client,
}

/// One hub room: the connected clients and the documents they share.
pub struct Session {
    session_id: String,
    peers: IndexMap<ConnectionId, Peer>,
    documents: HashMap<String, Document>,
    store: Arc<dyn FileStore>,
    engines: Arc<dyn OtEngineFactory>,
    /// Self-sender: spawned load/save tasks complete through it.
    events: mpsc::UnboundedSender<SessionEvent>,
    save_every: u64,
    next_epoch: u64,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn FileStore>,
        engines: Arc<dyn OtEngineFactory>,
        save_every: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            peers: IndexMap::new(),
            documents: HashMap::new(),
            store,
            engines,
            events,
            save_every,
            next_epoch: 0,
            stats: SessionStats {
                created: Instant::now(),
                connections: 0,
                messages: 0,
            },
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drive the session to completion. Ends once no peers remain and
    /// every draining document has finished its teardown save.
    ///
    /// Teardown must not lose a registration queued behind the last
    /// disconnect: the queue is drained before the channel is closed,
    /// and a `Connected` found there revives the session. Once closed,
    /// sends fail and the gateway re-registers against a fresh session.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("session {} started", self.session_id);
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
            if self.stats.connections > 0 && self.peers.is_empty() && self.documents.is_empty() {
                while let Ok(queued) = rx.try_recv() {
                    self.handle_event(queued);
                }
                if self.peers.is_empty() && self.documents.is_empty() {
                    // Anything sent before this close is still queued and
                    // gets handled before recv yields None.
                    rx.close();
                }
            }
        }
        if !self.peers.is_empty() {
            warn!(
                "session {} closed with {} peer(s) registered mid-teardown",
                self.session_id,
                self.peers.len()
            );
        }
        info!(
            "session {} ended: {} connection(s), {} message(s), lifetime {:?}",
            self.session_id,
            self.stats.connections,
            self.stats.messages,
            self.stats.created.elapsed()
        );
    }

    /// Apply one event. All mutation is synchronous; nothing here awaits.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { handle, client } => self.connection_joined(handle, client),
            SessionEvent::Disconnected { conn } => self.connection_left(conn),
            SessionEvent::Message { conn, message } => {
                self.stats.messages += 1;
                self.dispatch(conn, message);
            }
            SessionEvent::LoadFinished { doc, epoch, result } => {
                self.load_finished(&doc, epoch, result)
            }
            SessionEvent::SaveFinished {
                doc,
                epoch,
                cause,
                result,
            } => self.save_finished(&doc, epoch, cause, result),
        }
    }

    /// Register presence, announce it, and reply with peer metadata.
    fn connection_joined(&mut self, handle: ConnectionHandle, client: Client) {
        info!(
            "client {} connected to session {} as connection {}",
            client.client_id, self.session_id, handle.id
        );
        self.stats.connections += 1;

        let announce = ServerMessage::ClientJoined {
            client_id: client.client_id.clone(),
            name: client.name.clone(),
            color: client.color.clone(),
        };
        self.notify_all(None, &announce, false);

        handle.send(ServerMessage::InitConnection {
            peer_count: self.peers.len(),
        });
        self.peers.insert(handle.id, Peer { handle, client });
    }

    /// Remove the client and run the leave path against its document.
    fn connection_left(&mut self, conn: ConnectionId) {
        let Some(peer) = self.peers.swap_remove(&conn) else {
            return;
        };
        info!(
            "client {} disconnected from session {}",
            peer.client.client_id, self.session_id
        );
        self.notify_all(
            None,
            &ServerMessage::ClientLeft {
                client_id: peer.client.client_id.clone(),
            },
            true,
        );
        if !peer.client.location.is_empty() {
            let location = peer.client.location.clone();
            self.leave_document(conn, &location);
        }
    }

    /// Route one inbound message per the protocol contract.
    fn dispatch(&mut self, conn: ConnectionId, message: ClientMessage) {
        if !self.peers.contains_key(&conn) {
            debug!("message from unregistered connection {conn} dropped");
            return;
        }
        match message {
            // The gateway consumes the handshake; a relayed one is inert.
            ClientMessage::Authenticate { .. } => {}
            ClientMessage::JoinDocument { doc, .. } => self.join_document(conn, &doc),
            ClientMessage::Operation {
                doc,
                client_id,
                operation,
                revision,
            } => {
                let views = self.doc_client_views(&doc);
                match self.documents.get_mut(&doc) {
                    Some(document) => {
                        if let Some(text) =
                            document.apply_operation(conn, &client_id, operation, revision, &views)
                        {
                            let epoch = document.epoch();
                            self.spawn_save(doc, epoch, text, SaveCause::Checkpoint);
                        }
                    }
                    None => self.reply_error(conn, format!("Invalid document {doc}")),
                }
            }
            ClientMessage::Selection {
                doc,
                client_id,
                selection,
            } => {
                if let Some(peer) = self.peers.get_mut(&conn) {
                    peer.client.selection = Some(selection.clone());
                }
                match self.documents.get(&doc) {
                    Some(document) => document.selection(conn, &client_id, selection),
                    None => self.reply_error(conn, format!("Invalid document {doc}")),
                }
            }
            ClientMessage::LeaveDocument { .. } => {
                let Some(peer) = self.peers.get_mut(&conn) else {
                    return;
                };
                if peer.client.location.is_empty() {
                    return;
                }
                let location = std::mem::take(&mut peer.client.location);
                self.leave_document(conn, &location);
            }
            ClientMessage::UpdateClient {
                name,
                color,
                location,
                ..
            } => self.update_client(conn, name, color, location),
            ClientMessage::GetClients => {
                let views: Vec<ClientView> =
                    self.peers.values().map(|p| p.client.serialize()).collect();
                let Some(peer) = self.peers.get(&conn) else {
                    return;
                };
                for view in views {
                    peer.handle.send(ServerMessage::ClientJoined {
                        client_id: view.client_id,
                        name: view.name,
                        color: view.color,
                    });
                }
            }
        }
    }

    /// Join `doc_id`, vacating any previously joined document first —
    /// documents are mutually exclusive per client, and this is the one
    /// place (with the leave paths) that writes `location`.
    fn join_document(&mut self, conn: ConnectionId, doc_id: &str) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        let previous = std::mem::take(&mut peer.client.location);
        if !previous.is_empty() && previous != doc_id {
            self.leave_document(conn, &previous);
        }

        let (view, handle, client_id) = match self.peers.get_mut(&conn) {
            Some(peer) => {
                peer.client.location = doc_id.to_string();
                (
                    peer.client.serialize(),
                    peer.handle.clone(),
                    peer.client.client_id.clone(),
                )
            }
            None => return,
        };

        let needs_create = match self.documents.get(doc_id) {
            None => true,
            // A teardown save is still in flight; the old state is gone
            // from authority, so this join gets a fresh document and load.
            Some(doc) => doc.is_draining(),
        };
        if needs_create {
            let epoch = self.next_epoch;
            self.next_epoch += 1;
            let doc = Document::new(doc_id, &self.session_id, epoch, self.save_every);
            if self.documents.insert(doc_id.to_string(), doc).is_some() {
                info!("document {doc_id} superseded while its teardown save was in flight");
            }
            self.spawn_load(doc_id.to_string(), epoch);
        }

        let views = self.doc_client_views(doc_id);
        if let Some(document) = self.documents.get_mut(doc_id) {
            document.join(handle, &client_id, view, &views);
        }
    }

    /// Shared leave path for `leave-document`, rejoin-elsewhere, and
    /// disconnect. The caller has already cleared the client's location.
    fn leave_document(&mut self, conn: ConnectionId, doc_id: &str) {
        let Some(document) = self.documents.get_mut(doc_id) else {
            return;
        };
        match document.leave(conn) {
            LeaveOutcome::Remaining => {}
            LeaveOutcome::Empty { text: Some(text) } => {
                let epoch = document.epoch();
                // Document stays resident (draining) until the save
                // resolves; eviction happens in save_finished.
                self.spawn_save(doc_id.to_string(), epoch, text, SaveCause::Teardown);
            }
            LeaveOutcome::Empty { text: None } => {
                self.documents.remove(doc_id);
                info!("document {doc_id} discarded before its load completed");
            }
        }
    }

    /// Apply name/color changes and broadcast `client-updated` only when
    /// something actually changed. Location changes are not applied here:
    /// join/leave own that field.
    fn update_client(
        &mut self,
        conn: ConnectionId,
        name: Option<String>,
        color: Option<String>,
        location: Option<String>,
    ) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        let mut changed = false;
        if let Some(name) = name {
            if name != peer.client.name {
                peer.client.name = name;
                changed = true;
            }
        }
        if let Some(color) = color {
            if color != peer.client.color {
                peer.client.color = color;
                changed = true;
            }
        }
        if location.is_some() {
            debug!("ignoring location change via update-client; join/leave own that field");
        }
        if !changed {
            return;
        }

        let view = peer.client.serialize();
        let msg = ServerMessage::ClientUpdated {
            client_id: view.client_id.clone(),
            name: view.name.clone(),
            color: view.color.clone(),
            location: view.location.clone(),
        };
        // Roster members hear it from their document, everyone else from
        // the session, so each peer sees exactly one broadcast.
        let location = view.location.clone();
        let doc_broadcast = !location.is_empty() && self.documents.contains_key(&location);
        if doc_broadcast {
            if let Some(document) = self.documents.get(&location) {
                document.update_presence(conn, &view);
            }
        }
        for (id, peer) in &self.peers {
            if *id == conn {
                continue;
            }
            if doc_broadcast && peer.client.location == location {
                continue;
            }
            peer.handle.send(msg.clone());
        }
    }

    fn load_finished(&mut self, doc_id: &str, epoch: u64, result: Result<String, StoreError>) {
        let views = self.doc_client_views(doc_id);
        let Some(document) = self.documents.get_mut(doc_id) else {
            debug!("load finished for evicted document {doc_id}");
            return;
        };
        if document.epoch() != epoch {
            debug!("stale load for {doc_id} dropped (epoch {epoch})");
            return;
        }
        match result {
            Ok(text) => {
                let engine = self.engines.create(&text);
                document.load_finished(engine, &views);
            }
            Err(err) => document.load_failed(&err),
        }
    }

    fn save_finished(
        &mut self,
        doc_id: &str,
        epoch: u64,
        cause: SaveCause,
        result: Result<(), StoreError>,
    ) {
        match &result {
            Ok(()) => debug!("saved {doc_id} ({cause:?})"),
            // Edits already applied stay authoritative in memory until the
            // next successful save; no retry.
            Err(err) => warn!("save of {doc_id} failed ({cause:?}): {err}"),
        }
        if cause != SaveCause::Teardown {
            return;
        }
        let matches = self
            .documents
            .get(doc_id)
            .is_some_and(|d| d.epoch() == epoch && d.is_draining());
        if matches {
            self.documents.remove(doc_id);
            info!("document {doc_id} evicted after teardown save");
        }
    }

    /// Session-wide fan-out.
    pub fn notify_all(&self, origin: Option<ConnectionId>, msg: &ServerMessage, include_origin: bool) {
        for (id, peer) in &self.peers {
            if Some(*id) == origin && !include_origin {
                continue;
            }
            peer.handle.send(msg.clone());
        }
    }

    fn reply_error(&self, conn: ConnectionId, error: String) {
        if let Some(peer) = self.peers.get(&conn) {
            peer.handle.send(ServerMessage::Error { error });
        }
    }

    /// Presence views of every client currently located in `doc_id` —
    /// by the location invariant, exactly the document's roster.
    fn doc_client_views(&self, doc_id: &str) -> Vec<ClientView> {
        self.peers
            .values()
            .filter(|p| p.client.location == doc_id)
            .map(|p| p.client.serialize())
            .collect()
    }

    fn spawn_load(&self, doc_id: String, epoch: u64) {
        let store = self.store.clone();
        let session_id = self.session_id.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = store.load(&doc_id, &session_id).await;
            let _ = events.send(SessionEvent::LoadFinished {
                doc: doc_id,
                epoch,
                result,
            });
        });
    }

    fn spawn_save(&self, doc_id: String, epoch: u64, text: String, cause: SaveCause) {
        let store = self.store.clone();
        let session_id = self.session_id.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = store.save(&doc_id, &session_id, &text).await;
            let _ = events.send(SessionEvent::SaveFinished {
                doc: doc_id,
                epoch,
                cause,
                result,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::LinearEngineFactory;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// In-memory store that records calls and answers immediately.
    struct MockStore {
        text: String,
        loads: Mutex<Vec<String>>,
        saves: Mutex<Vec<(String, String)>>,
    }

    impl MockStore {
        fn new(text: &str) -> Arc<Self> {
            Arc::new(Self {
                text: text.to_string(),
                loads: Mutex::new(Vec::new()),
                saves: Mutex::new(Vec::new()),
            })
        }

        fn load_count(&self) -> usize {
            self.loads.lock().unwrap().len()
        }

        fn saved(&self) -> Vec<(String, String)> {
            self.saves.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FileStore for MockStore {
        async fn load(&self, doc_id: &str, _session_id: &str) -> Result<String, StoreError> {
            self.loads.lock().unwrap().push(doc_id.to_string());
            Ok(self.text.clone())
        }

        async fn save(&self, doc_id: &str, _session_id: &str, text: &str) -> Result<(), StoreError> {
            self.saves
                .lock()
                .unwrap()
                .push((doc_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Harness {
        session: Session,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
        store: Arc<MockStore>,
    }

    impl Harness {
        fn new(text: &str) -> Self {
            let store = MockStore::new(text);
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Session::new(
                "room",
                store.clone(),
                Arc::new(LinearEngineFactory),
                5,
                tx,
            );
            Self {
                session,
                events_rx: rx,
                store,
            }
        }

        fn connect(&mut self, id: u64, name: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
            let (handle, rx) = ConnectionHandle::channel(ConnectionId(id));
            self.session.handle_event(SessionEvent::Connected {
                handle,
                client: Client::new(name, name),
            });
            rx
        }

        fn message(&mut self, id: u64, message: ClientMessage) {
            self.session.handle_event(SessionEvent::Message {
                conn: ConnectionId(id),
                message,
            });
        }

        /// Pump spawned-task completions back into the session.
        async fn settle(&mut self) {
            while let Ok(event) =
                tokio::time::timeout(std::time::Duration::from_millis(50), self.events_rx.recv())
                    .await
            {
                match event {
                    Some(event) => self.session.handle_event(event),
                    None => break,
                }
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn join(doc: &str, client_id: &str) -> ClientMessage {
        ClientMessage::JoinDocument {
            doc: doc.into(),
            client_id: client_id.into(),
        }
    }

    #[tokio::test]
    async fn test_connection_joined_announces_and_replies() {
        let mut h = Harness::new("");
        let mut alice_rx = h.connect(1, "alice");
        let mut bob_rx = h.connect(2, "bob");

        let to_alice = drain(&mut alice_rx);
        assert!(matches!(
            to_alice[0],
            ServerMessage::InitConnection { peer_count: 0 }
        ));
        // Alice also hears bob arriving
        assert!(matches!(to_alice[1], ServerMessage::ClientJoined { .. }));

        let to_bob = drain(&mut bob_rx);
        assert!(matches!(
            to_bob[0],
            ServerMessage::InitConnection { peer_count: 1 }
        ));
    }

    #[tokio::test]
    async fn test_racing_joins_issue_one_load() {
        let mut h = Harness::new("shared text");
        let mut alice_rx = h.connect(1, "alice");
        let mut bob_rx = h.connect(2, "bob");
        h.message(1, join("notes.txt", "alice"));
        h.message(2, join("notes.txt", "bob"));

        // Both joins landed before the load resolved
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        h.settle().await;

        assert_eq!(h.store.load_count(), 1);
        let alice_init: Vec<_> = drain(&mut alice_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::InitDocument { .. }))
            .collect();
        let bob_init: Vec<_> = drain(&mut bob_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::InitDocument { .. }))
            .collect();
        assert_eq!(alice_init.len(), 1);
        assert_eq!(bob_init, alice_init);
        match &alice_init[0] {
            ServerMessage::InitDocument {
                operation,
                revision,
                clients,
                ..
            } => {
                assert_eq!(*operation, json!(["shared text"]));
                assert_eq!(*revision, 0);
                assert_eq!(clients.len(), 2);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_operation_flow_acks_and_checkpoints() {
        let mut h = Harness::new("abcd");
        let mut alice_rx = h.connect(1, "alice");
        h.message(1, join("d", "alice"));
        h.settle().await;
        drain(&mut alice_rx);

        for rev in 0u64..5 {
            h.message(
                1,
                ClientMessage::Operation {
                    doc: "d".into(),
                    client_id: "alice".into(),
                    operation: json!([4 + rev, "x"]),
                    revision: rev,
                },
            );
        }
        h.settle().await;

        let acks = drain(&mut alice_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Ack { .. }))
            .count();
        assert_eq!(acks, 5);
        // One checkpoint at revision 5
        assert_eq!(h.store.saved(), vec![("d".into(), "abcdxxxxx".into())]);
    }

    #[tokio::test]
    async fn test_unknown_document_gets_error_reply() {
        let mut h = Harness::new("");
        let mut alice_rx = h.connect(1, "alice");
        drain(&mut alice_rx);
        h.message(
            1,
            ClientMessage::Operation {
                doc: "nope".into(),
                client_id: "alice".into(),
                operation: json!([]),
                revision: 0,
            },
        );
        let msgs = drain(&mut alice_rx);
        assert!(matches!(
            &msgs[0],
            ServerMessage::Error { error } if error.contains("nope")
        ));
    }

    #[tokio::test]
    async fn test_last_leave_saves_then_evicts() {
        let mut h = Harness::new("content");
        let mut alice_rx = h.connect(1, "alice");
        h.message(1, join("d", "alice"));
        h.settle().await;
        drain(&mut alice_rx);

        h.message(1, ClientMessage::LeaveDocument { client_id: "alice".into() });
        // Draining but still resident until the save resolves
        assert!(h.session.documents.get("d").is_some_and(|d| d.is_draining()));
        h.settle().await;
        assert!(h.session.documents.is_empty());
        assert_eq!(h.store.saved(), vec![("d".into(), "content".into())]);
    }

    #[tokio::test]
    async fn test_join_during_teardown_gets_fresh_load() {
        let mut h = Harness::new("content");
        let mut alice_rx = h.connect(1, "alice");
        h.message(1, join("d", "alice"));
        h.settle().await;
        drain(&mut alice_rx);

        h.message(1, ClientMessage::LeaveDocument { client_id: "alice".into() });
        // Rejoin before the teardown save resolves: fresh document
        h.message(1, join("d", "alice"));
        assert!(h.session.documents.get("d").is_some_and(|d| d.is_loading()));
        h.settle().await;

        assert_eq!(h.store.load_count(), 2);
        assert!(h.session.documents.get("d").is_some_and(|d| !d.is_draining()));
    }

    #[tokio::test]
    async fn test_switching_documents_vacates_previous() {
        let mut h = Harness::new("x");
        let mut alice_rx = h.connect(1, "alice");
        let _bob_rx = h.connect(2, "bob");
        h.message(1, join("a", "alice"));
        h.message(2, join("a", "bob"));
        h.settle().await;
        drain(&mut alice_rx);

        h.message(1, join("b", "alice"));
        h.settle().await;

        assert_eq!(
            h.session.peers.get(&ConnectionId(1)).unwrap().client.location,
            "b"
        );
        assert_eq!(h.session.documents.get("a").unwrap().roster_len(), 1);
        assert_eq!(h.session.documents.get("b").unwrap().roster_len(), 1);
    }

    #[tokio::test]
    async fn test_update_client_unchanged_is_silent() {
        let mut h = Harness::new("");
        let mut alice_rx = h.connect(1, "alice");
        let mut bob_rx = h.connect(2, "bob");
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let client = h.session.peers.get(&ConnectionId(1)).unwrap().client.clone();
        h.message(
            1,
            ClientMessage::UpdateClient {
                client_id: "alice".into(),
                name: Some(client.name),
                color: Some(client.color),
                location: None,
            },
        );
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_update_client_changed_broadcasts_once() {
        let mut h = Harness::new("");
        let mut alice_rx = h.connect(1, "alice");
        let mut bob_rx = h.connect(2, "bob");
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        h.message(
            1,
            ClientMessage::UpdateClient {
                client_id: "alice".into(),
                name: Some("Alice Prime".into()),
                color: None,
                location: None,
            },
        );
        let msgs = drain(&mut bob_rx);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(
            &msgs[0],
            ServerMessage::ClientUpdated { name, .. } if name == "Alice Prime"
        ));
        // No echo to the originator
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_update_client_ignores_location() {
        let mut h = Harness::new("");
        let _alice_rx = h.connect(1, "alice");
        h.message(
            1,
            ClientMessage::UpdateClient {
                client_id: "alice".into(),
                name: None,
                color: None,
                location: Some("d".into()),
            },
        );
        assert!(h
            .session
            .peers
            .get(&ConnectionId(1))
            .unwrap()
            .client
            .location
            .is_empty());
    }

    #[tokio::test]
    async fn test_get_clients_snapshot_reply() {
        let mut h = Harness::new("");
        let mut alice_rx = h.connect(1, "alice");
        let _bob_rx = h.connect(2, "bob");
        drain(&mut alice_rx);

        h.message(1, ClientMessage::GetClients);
        let msgs = drain(&mut alice_rx);
        assert_eq!(msgs.len(), 2);
        assert!(msgs
            .iter()
            .all(|m| matches!(m, ServerMessage::ClientJoined { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_runs_document_leave() {
        let mut h = Harness::new("text");
        let mut alice_rx = h.connect(1, "alice");
        let _bob_rx = h.connect(2, "bob");
        h.message(1, join("d", "alice"));
        h.message(2, join("d", "bob"));
        h.settle().await;
        drain(&mut alice_rx);

        h.session
            .handle_event(SessionEvent::Disconnected { conn: ConnectionId(2) });
        h.settle().await;

        assert_eq!(h.session.documents.get("d").unwrap().roster_len(), 1);
        let msgs = drain(&mut alice_rx);
        // client-left from the session and from the document roster
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::ClientLeft { client_id } if client_id == "bob")));
    }

    #[tokio::test]
    async fn test_registration_queued_behind_last_disconnect_survives() {
        let store = MockStore::new("");
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "room",
            store,
            Arc::new(LinearEngineFactory),
            5,
            tx.clone(),
        );

        let (alice, _alice_rx) = ConnectionHandle::channel(ConnectionId(1));
        let (bob, mut bob_rx) = ConnectionHandle::channel(ConnectionId(2));

        // Bob's registration is already in the queue when alice's
        // disconnect empties the session
        tx.send(SessionEvent::Connected {
            handle: alice,
            client: Client::new("alice", "alice"),
        })
        .unwrap();
        tx.send(SessionEvent::Disconnected { conn: ConnectionId(1) })
            .unwrap();
        tx.send(SessionEvent::Connected {
            handle: bob,
            client: Client::new("bob", "bob"),
        })
        .unwrap();
        tokio::spawn(session.run(rx));

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), bob_rx.recv())
            .await
            .expect("timed out")
            .expect("registration was dropped at teardown");
        assert!(matches!(msg, ServerMessage::InitConnection { peer_count: 0 }));

        // The revived session still routes
        tx.send(SessionEvent::Message {
            conn: ConnectionId(2),
            message: ClientMessage::GetClients,
        })
        .unwrap();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), bob_rx.recv())
            .await
            .expect("timed out")
            .expect("session stopped routing");
        assert!(matches!(
            msg,
            ServerMessage::ClientJoined { client_id, .. } if client_id == "bob"
        ));
    }

    #[tokio::test]
    async fn test_stats_count_connections_and_messages() {
        let mut h = Harness::new("");
        let _alice_rx = h.connect(1, "alice");
        let _bob_rx = h.connect(2, "bob");
        h.message(1, ClientMessage::GetClients);
        h.message(1, ClientMessage::GetClients);
        h.message(2, ClientMessage::GetClients);

        assert_eq!(h.session.stats.connections, 2);
        assert_eq!(h.session.stats.messages, 3);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_joiners_queued() {
        struct FailingStore;
        #[async_trait]
        impl FileStore for FailingStore {
            async fn load(&self, _: &str, _: &str) -> Result<String, StoreError> {
                Err(StoreError::Status { status: 500 })
            }
            async fn save(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(
            "room",
            Arc::new(FailingStore),
            Arc::new(LinearEngineFactory),
            5,
            tx,
        );
        let (handle, mut alice_rx) = ConnectionHandle::channel(ConnectionId(1));
        session.handle_event(SessionEvent::Connected {
            handle,
            client: Client::new("alice", "alice"),
        });
        session.handle_event(SessionEvent::Message {
            conn: ConnectionId(1),
            message: join("d", "alice"),
        });
        if let Some(event) = rx.recv().await {
            session.handle_event(event);
        }

        // Still loading, no init delivered, session intact
        assert!(session.documents.get("d").is_some_and(|d| d.is_loading()));
        assert!(!drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::InitDocument { .. })));
    }
}
