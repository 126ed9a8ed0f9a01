//! WebSocket gateway: accept loop, authentication, frame relay.
//!
//! ```text
//! ws://host:port/hub/<session-id>
//!
//! editor ── authenticate ──► Gateway ── verify(token) ──► TokenVerifier
//!        ◄─ authenticated ──┘
//!        ── <frames> ──────► Session (as SessionEvent::Message)
//!        ◄─ <frames> ─────── outbox (writer task)
//! ```
//!
//! Each connection runs a reader loop plus a spawned writer task draining
//! the connection's outbox. Frames received before a successful
//! `authenticate` are silently ignored, as are frames with invalid tokens.
//! After authentication, malformed frames are logged and dropped and
//! unknown message types are answered with an `error` reply.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{decode, DecodingKey, Validation};
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use collab_hub::client::Client;
use collab_hub::hub::{Hub, SessionHandle};
use collab_hub::protocol::{ClientMessage, ProtocolError, ServerMessage};
use collab_hub::session::{ConnectionHandle, SessionEvent};

/// Token rejection. Never sent to the peer; failed handshakes are
/// ignored so probes learn nothing.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by an accepted token.
#[derive(Debug, Deserialize)]
pub struct AuthClaims {
    pub username: String,
}

/// Token verification seam, mockable in tests.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthClaims, AuthError>;
}

/// HS256 verification with a secret shared with the file server.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        // Tokens from the file server carry no expiry claim
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let data = decode::<AuthClaims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

/// The accept loop and per-connection plumbing.
pub struct Gateway {
    hub: Arc<Hub>,
    verifier: Arc<dyn TokenVerifier>,
}

impl Gateway {
    pub fn new(hub: Arc<Hub>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { hub, verifier }
    }

    /// Serve connections on an already-bound listener.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("hub listening on {addr}");
        }
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("tcp connection from {addr}");
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, addr).await {
                    debug!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        // The session id rides on the request path; reject pathless
        // upgrades before completing the handshake.
        let mut session_id = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match parse_session_id(req.uri().path()) {
                Some(id) => {
                    session_id = Some(id);
                    Ok(resp)
                }
                None => {
                    let mut reject = ErrorResponse::new(Some("No session id".to_string()));
                    *reject.status_mut() = StatusCode::NOT_FOUND;
                    Err(reject)
                }
            }
        })
        .await?;
        let Some(session_id) = session_id else {
            return Ok(());
        };

        let conn = self.hub.next_connection_id();
        info!("connection {conn} from {addr} to session {session_id}");

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (handle, mut outbox) = ConnectionHandle::channel(conn);

        // Writer: drain the outbox until every handle to it is dropped.
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbox.recv().await {
                if ws_sender.send(Message::text(msg.to_json())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut session: Option<SessionHandle> = None;
        while let Some(frame) = ws_receiver.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("websocket error on connection {conn}: {e}");
                    break;
                }
            };
            match &session {
                None => {
                    if let Some(active) =
                        self.try_authenticate(&session_id, &handle, text.as_str())
                    {
                        session = Some(active);
                    }
                }
                Some(active) => match ClientMessage::parse(text.as_str()) {
                    Ok(message) => active.send(SessionEvent::Message { conn, message }),
                    Err(ProtocolError::UnknownType(name)) => {
                        handle.send(ServerMessage::Error {
                            error: format!("Unknown message type: {name}"),
                        });
                    }
                    Err(ProtocolError::Malformed(reason)) => {
                        warn!("malformed frame on connection {conn}: {reason}");
                    }
                },
            }
        }

        if let Some(active) = session {
            active.send(SessionEvent::Disconnected { conn });
        }
        drop(handle);
        let _ = writer.await;
        info!("connection {conn} closed");
        Ok(())
    }

    /// Handle one pre-auth frame. Anything other than a verifiable
    /// `authenticate` is dropped without a reply.
    fn try_authenticate(
        &self,
        session_id: &str,
        handle: &ConnectionHandle,
        text: &str,
    ) -> Option<SessionHandle> {
        let Ok(ClientMessage::Authenticate { token, client_id }) = ClientMessage::parse(text)
        else {
            debug!("ignoring pre-auth frame on connection {}", handle.id);
            return None;
        };
        let claims = match self.verifier.verify(&token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("authentication failed on connection {}: {e}", handle.id);
                return None;
            }
        };

        handle.send(ServerMessage::Authenticated);
        let mut event = SessionEvent::Connected {
            handle: handle.clone(),
            client: Client::new(client_id, claims.username),
        };
        // The session can tear down between the registry lookup and the
        // send; a rejected registration re-delivers to a fresh actor
        // rather than stranding an authenticated connection.
        loop {
            let session = self.hub.session(session_id);
            match session.try_send(event) {
                Ok(()) => return Some(session),
                Err(rejected) => {
                    debug!("session {session_id} ended mid-registration; retrying");
                    event = rejected;
                }
            }
        }
    }
}

/// Extract the session id from a `/hub/<id>` request path.
fn parse_session_id(path: &str) -> Option<String> {
    let rest = path.trim_start_matches('/').strip_prefix("hub")?;
    let id: String = rest.chars().filter(|c| *c != '/').collect();
    if rest.starts_with('/') && !id.is_empty() {
        Some(id)
    } else {
        None
    }
}
