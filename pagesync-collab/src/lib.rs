//! # pagesync-collab: real-time collaboration for page documents
//!
//! WebSocket relay, sync client and the session adapter that editors use to
//! share a [`pagesync_core::PageDocument`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐     WebSocket      ┌─────────────┐
//! │ CollaborationSession │ ◄─────────────────► │ SyncServer  │
//! │  SyncClient          │     Binary Proto    │ (relay)     │
//! │  PresenceRoom        │                     └──────┬──────┘
//! └──────────┬───────────┘                            │
//!            ▼                                        ▼
//! ┌──────────────────────┐                     ┌─────────────┐
//! │ CollaborationEngine  │                     │ Room        │
//! │ (local yrs replica)  │                     │ yrs Doc +   │
//! └──────────────────────┘                     │ broadcast   │
//!                                              └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded `SyncMessage`
//! - [`broadcast`]: per-document rooms and fan-out
//! - [`server`]: the relay
//! - [`client`]: WebSocket client with offline queue
//! - [`presence`]: users, cursors, awareness snapshots
//! - [`session`]: the collaboration adapter
//! - [`subscription`]: listener registries
//! - [`overlay`]: avatar bar and cursor view-models

pub mod broadcast;
pub mod client;
pub mod overlay;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod subscription;

pub use broadcast::{BroadcastGroup, BroadcastStats, Room, RoomManager};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use overlay::{cursor_overlays, presence_indicators, CursorOverlay, PresenceBar, PresenceIndicator, PresenceOverlay};
pub use presence::{
    AwarenessMessage, AwarenessSnapshot, CursorColor, PresenceRoom, PresenceState, RemoteCursorState, User, Vec2,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{CollaborationSession, ReconnectPolicy, SessionConfig, SessionError};
pub use subscription::{Listeners, Subscription};
