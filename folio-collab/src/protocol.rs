//! Wire envelope for the collaboration socket.
//!
//! Every WebSocket binary frame carries one bincode-encoded event:
//! ```text
//! client → server                    server → client
//! ┌──────────────────────────┐       ┌──────────────────────────────┐
//! │ JoinRoom { key, user }   │       │ Sync(y-sync message)         │
//! │ Sync(y-sync message)     │       │ Update(raw yrs update)       │
//! │ Update(raw yrs update)   │       │ UserJoined(PresenceEntry)    │
//! └──────────────────────────┘       │ UserLeft { user_id }         │
//!                                    │ CurrentUsers(Vec<Presence…>) │
//!                                    └──────────────────────────────┘
//! ```
//!
//! `Sync` payloads use the y-sync encoding from [`yrs::sync`]: a leading
//! varint tag (0 = sync, 1 = awareness) followed by the step-1 / step-2 /
//! update or awareness body.

use folio_core::{KeyError, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use yrs::sync::awareness::AwarenessUpdate;
use yrs::sync::{Awareness, Message, SyncMessage};
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact};

/// Per-socket identifier. Distinct from the user id: one user may hold
/// several connections (tabs) in the same room.
pub type ConnectionId = Uuid;

/// Identity announced in the join handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub name: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
        }
    }
}

/// One connection's presence in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    JoinRoom {
        document_key: String,
        user: UserIdentity,
    },
    Sync(Vec<u8>),
    Update(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    Sync(Vec<u8>),
    Update(Vec<u8>),
    UserJoined(PresenceEntry),
    UserLeft { user_id: UserId },
    CurrentUsers(Vec<PresenceEntry>),
}

impl ClientEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(event)
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(event)
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Encode(String),
    #[error("deserialization error: {0}")]
    Decode(String),
    #[error("malformed CRDT payload: {0}")]
    Crdt(String),
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    #[error("message received before join-room")]
    NotJoined,
    #[error("room is closed")]
    RoomClosed,
}

// ── y-sync message builders ───────────────────────────────────────

/// Step 1: "here is what I have", answered with a step 2 diff.
pub fn sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

pub fn sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

pub fn sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn awareness_message(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// Step-1 request for an existing replica.
pub fn step1_for(awareness: &Awareness) -> Vec<u8> {
    let sv = awareness.doc().transact().state_vector();
    sync_step1(sv)
}
