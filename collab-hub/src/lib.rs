//! # collab-hub — Real-time collaboration hub
//!
//! Session and document coordination for multiplayer text editing over
//! WebSocket, with operational transformation delegated to a pluggable
//! engine and document text persisted through a remote file service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │   Editor    │ ◄─────────────────► │   Gateway   │
//! │ (per user)  │     JSON frames     │  (accept)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ SessionEvent
//!                                            ▼
//!                                     ┌─────────────┐
//!                                     │   Session   │  one task per room
//!                                     │   (actor)   │
//!                                     └──────┬──────┘
//!                                            │
//!                              ┌─────────────┼─────────────┐
//!                              ▼             ▼             ▼
//!                       ┌──────────┐  ┌──────────┐  ┌──────────┐
//!                       │ Document │  │ OtEngine │  │ FileStore│
//!                       │ (roster) │  │ (seam)   │  │  (HTTP)  │
//!                       └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (tagged ClientMessage/ServerMessage)
//! - [`client`] — Presence records and name→color derivation
//! - [`ot`] — OT engine seam plus the shipped head-only engine
//! - [`store`] — Persistence gateway trait and HTTP implementation
//! - [`document`] — Per-document state machine (loading/ready/draining)
//! - [`session`] — Session actor: routing, presence, save scheduling
//! - [`hub`] — Registry of live session actors
//! - [`config`] — Endpoint and checkpoint configuration

pub mod client;
pub mod config;
pub mod document;
pub mod hub;
pub mod ot;
pub mod protocol;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use client::{color_for_name, Client, ClientView};
pub use config::HubConfig;
pub use document::{Document, LeaveOutcome};
pub use hub::{Hub, SessionHandle};
pub use ot::{LinearEngine, LinearEngineFactory, OtEngine, OtEngineFactory, OtError};
pub use protocol::{ClientMessage, ProtocolError, RawOperation, ServerMessage};
pub use session::{
    ConnectionHandle, ConnectionId, SaveCause, Session, SessionEvent, SessionStats,
};
pub use store::{FileStore, HttpFileStore, StoreError};
