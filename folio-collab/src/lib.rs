//! # folio-collab: real-time collaboration relay
//!
//! Multiplexes editing sessions for many documents over one WebSocket
//! server. Each document key gets a room actor holding the authoritative
//! yrs replica, its awareness state and the presence list.
//!
//! ```text
//! ┌──────────────┐   bincode envelope   ┌──────────────┐
//! │ browser tab  │ ◄──────────────────► │ CollabServer │
//! │ (yjs client) │   y-sync payloads    └──────┬───────┘
//! └──────────────┘                             │ RoomSession
//!                                              ▼
//!                                   ┌─────────────────────┐
//!                                   │ DocumentRegistry    │
//!                                   │  key → room actor   │
//!                                   └──────────┬──────────┘
//!                                              │
//!                     ┌────────────────┬───────┴────────┐
//!                     ▼                ▼                ▼
//!               yrs Doc +        PresenceTracker    Debouncer
//!               Awareness                           → ProjectStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire envelope and y-sync message builders
//! - [`presence`]: per-room presence entries and color assignment
//! - [`broadcast`]: bounded per-connection fan-out
//! - [`debounce`]: coalesced persistence of room content
//! - [`registry`]: room lookup, lifecycle and sessions
//! - [`server`]: WebSocket server

pub mod broadcast;
pub mod debounce;
pub mod presence;
pub mod protocol;
pub mod registry;
mod room;
pub mod server;

pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use debounce::Debouncer;
pub use presence::{PresenceTracker, OWNER_COLOR, PALETTE};
pub use protocol::{
    ClientEvent, ConnectionId, PresenceEntry, ProtocolError, ServerEvent, UserIdentity,
};
pub use registry::{DocumentRegistry, RegistryConfig, RoomSession};
pub use room::{RoomSnapshot, CONTENT_FIELD};
pub use server::{CollabServer, ServerConfig, ServerStats};
