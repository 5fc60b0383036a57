//! Room-based publish/subscribe over live connections.
//!
//! Delivery is best-effort: a publish hands the envelope to each connection's
//! sink without waiting, and a full or closed sink simply does not count as
//! reached. Clients reconcile missed events by pulling state.

use crate::envelope::Envelope;
use crate::error::CoreError;
use crate::ids::{ConnectionId, UserId};
use crate::presence::{Departure, PresenceChange, PresenceRegistry};
use crate::room::{validate_room_name, Room, RoomId};
use chorus_protocol::EventName;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Transport errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The connection is not in the room.
    #[error("Not in room: {0}")]
    NotInRoom(String),

    /// Per-connection room limit reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        let message = err.to_string();
        match err {
            TransportError::UnknownConnection(id) => CoreError::not_found("connection", id),
            TransportError::MaxRoomsReached => CoreError::Policy(message),
            TransportError::InvalidRoom(_) | TransportError::NotInRoom(_) => {
                CoreError::InvalidTarget(message)
            }
        }
    }
}

/// Outbound side of one connection.
pub trait EventSink: Send + Sync {
    /// Hand an event to the connection without waiting. Returns `false` if
    /// the connection could not take it.
    fn deliver(&self, envelope: Arc<Envelope>) -> bool;
}

impl EventSink for mpsc::Sender<Arc<Envelope>> {
    fn deliver(&self, envelope: Arc<Envelope>) -> bool {
        match self.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(env)) => {
                warn!(event = %env.event, "Outbound buffer full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum rooms a single connection may join.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,
    /// Outbound event buffer per connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Remove rooms once their last member leaves.
    #[serde(default = "default_true")]
    pub auto_delete_empty_rooms: bool,
}

fn default_max_rooms() -> usize {
    100
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: default_max_rooms(),
            outbound_buffer: default_outbound_buffer(),
            auto_delete_empty_rooms: true,
        }
    }
}

struct ConnectionEntry {
    user: UserId,
    sink: Arc<dyn EventSink>,
    rooms: HashSet<RoomId>,
}

/// Realtime transport.
///
/// Owns the outbound sink of every live connection and room membership, and
/// resolves users to handles through the [`PresenceRegistry`].
pub struct RealtimeTransport {
    presence: Arc<PresenceRegistry>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<RoomId, Room>,
    config: TransportConfig,
}

impl RealtimeTransport {
    #[must_use]
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self::with_config(presence, TransportConfig::default())
    }

    #[must_use]
    pub fn with_config(presence: Arc<PresenceRegistry>, config: TransportConfig) -> Self {
        info!("Creating realtime transport with config: {:?}", config);
        Self {
            presence,
            connections: DashMap::new(),
            rooms: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register a live connection for `user`.
    pub fn register(
        &self,
        user: &UserId,
        connection_id: &ConnectionId,
        sink: Arc<dyn EventSink>,
    ) -> PresenceChange {
        self.connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                user: user.clone(),
                sink,
                rooms: HashSet::new(),
            },
        );
        self.presence.add_connection(user, connection_id)
    }

    /// Drop a connection: leave all rooms, release its sink, update presence.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<Departure> {
        if let Some((_, entry)) = self.connections.remove(connection_id) {
            for room in &entry.rooms {
                self.remove_from_room(connection_id, room);
            }
        }
        let departure = self.presence.remove_connection(connection_id);
        debug!(connection = %connection_id, "Connection disconnected");
        departure
    }

    /// Join a room. Returns `Ok(false)` if the connection was already in it.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names, unknown connections, or when the
    /// per-connection room limit is reached.
    pub fn join(&self, connection_id: &ConnectionId, room: &str) -> Result<bool, TransportError> {
        validate_room_name(room).map_err(TransportError::InvalidRoom)?;

        {
            let mut entry = self
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| TransportError::UnknownConnection(connection_id.to_string()))?;
            if entry.rooms.contains(room) {
                return Ok(false);
            }
            if entry.rooms.len() >= self.config.max_rooms_per_connection {
                return Err(TransportError::MaxRoomsReached);
            }
            entry.rooms.insert(room.to_string());
        }

        self.rooms
            .entry(room.to_string())
            .or_insert_with(|| {
                debug!(room = %room, "Creating room");
                Room::new(room)
            })
            .join(connection_id.clone());

        // Lost a race with disconnect; undo so the room holds no dead handle.
        if !self.connections.contains_key(connection_id) {
            self.remove_from_room(connection_id, room);
            return Err(TransportError::UnknownConnection(connection_id.to_string()));
        }

        Ok(true)
    }

    /// Leave a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not in the room.
    pub fn leave(&self, connection_id: &ConnectionId, room: &str) -> Result<(), TransportError> {
        let removed = self
            .connections
            .get_mut(connection_id)
            .is_some_and(|mut entry| entry.rooms.remove(room));
        if !removed {
            return Err(TransportError::NotInRoom(room.to_string()));
        }
        self.remove_from_room(connection_id, room);
        Ok(())
    }

    fn remove_from_room(&self, connection_id: &ConnectionId, room: &str) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut r) => {
                r.leave(connection_id);
                r.is_empty()
            }
            None => false,
        };
        if now_empty && self.config.auto_delete_empty_rooms {
            self.rooms.remove_if(room, |_, r| r.is_empty());
            debug!(room = %room, "Deleted empty room");
        }
    }

    fn deliver_to(&self, connection_id: &ConnectionId, envelope: &Arc<Envelope>) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => entry.sink.deliver(Arc::clone(envelope)),
            None => false,
        }
    }

    /// Publish to every connection currently in `room`. Returns how many
    /// connections accepted the event.
    pub fn publish(&self, room: &str, event: EventName, payload: serde_json::Value) -> usize {
        let Some(members) = self.rooms.get(room).map(|r| r.members()) else {
            trace!(room = %room, event = %event, "Publish to empty room");
            return 0;
        };

        let envelope = Arc::new(Envelope::new(event, payload).in_room(room));
        let reached = members
            .iter()
            .filter(|conn| self.deliver_to(conn, &envelope))
            .count();
        trace!(room = %room, event = %event, reached, "Published to room");
        reached
    }

    /// Publish to every live connection of `user`. Returns how many
    /// connections accepted the event; 0 when the user is offline.
    pub fn publish_to_user(
        &self,
        user: &UserId,
        event: EventName,
        payload: serde_json::Value,
    ) -> usize {
        let handles = self.presence.connections_for(user);
        if handles.is_empty() {
            return 0;
        }

        let envelope = Arc::new(Envelope::new(event, payload));
        let reached = handles
            .iter()
            .filter(|conn| self.deliver_to(conn, &envelope))
            .count();
        trace!(user = %user, event = %event, reached, "Published to user");
        reached
    }

    /// User that owns a registered connection.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections.get(connection_id).map(|e| e.user.clone())
    }

    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    #[must_use]
    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.member_count()).unwrap_or(0)
    }

    /// Take every live connection of `user` out of `room`. Returns how
    /// many connections left it.
    pub fn remove_user_from_room(&self, user: &UserId, room: &str) -> usize {
        let removed = self
            .presence
            .connections_for(user)
            .iter()
            .filter(|conn| self.leave(conn, room).is_ok())
            .count();
        if removed > 0 {
            debug!(user = %user, room = %room, removed, "Removed user from room");
        }
        removed
    }

    /// Record activity for heartbeat tracking.
    pub fn touch(&self, connection_id: &ConnectionId) {
        self.presence.touch(connection_id);
    }

    /// Disconnect every connection silent for longer than `timeout`.
    pub fn prune_stale(&self, timeout: Duration) -> Vec<Departure> {
        self.presence
            .stale_connections(timeout)
            .iter()
            .filter_map(|conn| {
                debug!(connection = %conn, "Pruning stale connection");
                self.disconnect(conn)
            })
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            online_users: self.presence.online_users(),
            total_memberships: self.connections.iter().map(|e| e.rooms.len()).sum(),
        }
    }
}

/// Transport statistics.
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub room_count: usize,
    pub connection_count: usize,
    pub online_users: usize,
    pub total_memberships: usize,
}
