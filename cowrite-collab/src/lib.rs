//! # cowrite-collab — Real-time collaborative editing of scripts
//!
//! Clients edit their own copy of a script and exchange operations through a
//! central server that assigns every edit a place in one global order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Session     │                     │DocumentRoom │
//! │ SyncState   │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded envelopes)
//! - [`sync`] — Client-side state counter, edit buffer and history
//! - [`session`] — Sans-IO client session: handshake, recovery, presence
//! - [`room`] — Server-side authoritative document
//! - [`broadcast`] — Per-script fan-out
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client driving a [`Session`]

pub mod protocol;
pub mod timer;
pub mod sync;
pub mod presence;
pub mod session;
pub mod room;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{EditId, Envelope, Message, MessageType, PeerInfo, ProtocolError};
pub use sync::{EchoOutcome, PendingEdit, SyncState};
pub use presence::{MemberPresence, Roster, Selection};
pub use session::{
    Session, SessionConfig, SessionError, SessionEvent, SessionPhase, SyncFault,
};
pub use room::{DocumentRoom, RoomError};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientSnapshot, SyncClient, SyncEvent};
