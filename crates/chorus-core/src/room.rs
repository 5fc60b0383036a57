//! Rooms: named groups of connections that receive the same events.

use crate::ids::{ConnectionId, ConversationId};
use std::collections::HashSet;
use tracing::debug;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Room that carries a conversation's events.
#[must_use]
pub fn conversation_room(id: &ConversationId) -> RoomId {
    format!("conversation:{id}")
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Membership of one room.
#[derive(Debug)]
pub struct Room {
    name: RoomId,
    members: HashSet<ConnectionId>,
}

impl Room {
    #[must_use]
    pub fn new(name: impl Into<RoomId>) -> Self {
        Self {
            name: name.into(),
            members: HashSet::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains(connection_id)
    }

    /// Returns `true` if the connection was not yet a member.
    pub fn join(&mut self, connection_id: ConnectionId) -> bool {
        let added = self.members.insert(connection_id.clone());
        if added {
            debug!(room = %self.name, connection = %connection_id, "Connection joined room");
        }
        added
    }

    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id);
        if removed {
            debug!(room = %self.name, connection = %connection_id, "Connection left room");
        }
        removed
    }

    /// Snapshot of member handles.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
