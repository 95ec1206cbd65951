//! Presence tracking: who is connected to a room and with which color.
//!
//! Colors are assigned at join time:
//!
//! ```text
//! owner ───────────────► OWNER_COLOR (reserved)
//! 1st other user ──────► PALETTE[0]
//! 2nd other user ──────► PALETTE[1]
//! …                      PALETTE[n % PALETTE.len()]
//! ```
//!
//! The index is the user's position among the distinct non-owner users
//! currently in the room, so colors can shift when users leave and rejoin
//! in a different order. A second tab of a user already present reuses
//! that user's slot.

use std::collections::HashSet;

use folio_core::UserId;

use crate::protocol::{ConnectionId, PresenceEntry, UserIdentity};

/// Reserved color of the resource owner.
pub const OWNER_COLOR: &str = "#2563eb";

/// Colors handed out to everyone else, cycling.
pub const PALETTE: [&str; 8] = [
    "#dc2626", "#16a34a", "#d97706", "#9333ea", "#0891b2", "#db2777", "#65a30d", "#ea580c",
];

/// Presence entries of one room, in join order.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: Vec<PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its entry.
    pub fn join(
        &mut self,
        connection_id: ConnectionId,
        user: &UserIdentity,
        owner: Option<&UserId>,
    ) -> PresenceEntry {
        let color = self.color_for(&user.id, owner);
        let entry = PresenceEntry {
            connection_id,
            user_id: user.id.clone(),
            display_name: user.name.clone(),
            color: color.to_string(),
        };
        self.entries.retain(|e| e.connection_id != connection_id);
        self.entries.push(entry.clone());
        entry
    }

    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<PresenceEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| &e.connection_id == connection_id)?;
        Some(self.entries.remove(idx))
    }

    /// One entry per user: the most recently added connection wins.
    pub fn current_users(&self) -> Vec<PresenceEntry> {
        let mut seen = HashSet::new();
        let mut users: Vec<PresenceEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| seen.insert(e.user_id.clone()))
            .cloned()
            .collect();
        users.reverse();
        users
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn color_for(&self, user_id: &UserId, owner: Option<&UserId>) -> &'static str {
        if owner == Some(user_id) {
            return OWNER_COLOR;
        }

        let mut distinct: Vec<&UserId> = Vec::new();
        for entry in &self.entries {
            if Some(&entry.user_id) != owner && !distinct.contains(&&entry.user_id) {
                distinct.push(&entry.user_id);
            }
        }
        let slot = distinct
            .iter()
            .position(|id| *id == user_id)
            .unwrap_or(distinct.len());
        PALETTE[slot % PALETTE.len()]
    }
}
