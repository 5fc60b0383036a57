//! Presence tracking.
//!
//! Maps each user to the set of live connections they hold. A user is online
//! while that set is non-empty. State is process-local; running several
//! nodes needs an external backplane in front of this registry.

use crate::ids::{ConnectionId, UserId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Presence state for a single connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceState {
    pub connection_id: ConnectionId,
    pub connected_at: u64,
    pub last_seen: u64,
}

impl PresenceState {
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        let now = now_millis();
        Self {
            connection_id,
            connected_at: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    /// Check if this connection has been silent for longer than `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        now_millis().saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }
}

/// Result of registering a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// First connection for the user; they are now online.
    CameOnline,
    /// The user was already online on another device.
    AdditionalDevice,
    /// The handle was already registered for this user.
    Duplicate,
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user: UserId,
    pub connection_id: ConnectionId,
    /// The removed handle was the user's last one.
    pub went_offline: bool,
}

/// Registry of live connections per user.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: DashMap<UserId, HashMap<ConnectionId, PresenceState>>,
    owners: DashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection_id` for `user`. Idempotent per handle.
    pub fn add_connection(&self, user: &UserId, connection_id: &ConnectionId) -> PresenceChange {
        if let Some(previous) = self.owners.insert(connection_id.clone(), user.clone()) {
            if &previous == user {
                return PresenceChange::Duplicate;
            }
            // Handle reassigned to another user; detach it from the old one.
            self.detach(&previous, connection_id);
        }

        let mut conns = self.users.entry(user.clone()).or_default();
        let came_online = conns.is_empty();
        conns.insert(
            connection_id.clone(),
            PresenceState::new(connection_id.clone()),
        );
        drop(conns);

        if came_online {
            debug!(user = %user, connection = %connection_id, "Presence: user came online");
            PresenceChange::CameOnline
        } else {
            debug!(user = %user, connection = %connection_id, "Presence: additional device");
            PresenceChange::AdditionalDevice
        }
    }

    /// Remove a connection. Returns `None` for unknown handles.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Option<Departure> {
        let (_, user) = self.owners.remove(connection_id)?;
        let went_offline = self.detach(&user, connection_id);
        if went_offline {
            debug!(user = %user, connection = %connection_id, "Presence: user went offline");
        }
        Some(Departure {
            user,
            connection_id: connection_id.clone(),
            went_offline,
        })
    }

    /// Returns `true` if this removal emptied the user's connection set.
    fn detach(&self, user: &UserId, connection_id: &ConnectionId) -> bool {
        if let Some(mut conns) = self.users.get_mut(user) {
            conns.remove(connection_id);
        }
        self.users
            .remove_if(user, |_, conns| conns.is_empty())
            .is_some()
    }

    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.users.get(user).is_some_and(|c| !c.is_empty())
    }

    /// Live handles for `user`; empty when offline.
    #[must_use]
    pub fn connections_for(&self, user: &UserId) -> Vec<ConnectionId> {
        self.users
            .get(user)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn owner_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.owners.get(connection_id).map(|u| u.clone())
    }

    /// Number of users currently online.
    #[must_use]
    pub fn online_users(&self) -> usize {
        self.users.len()
    }

    /// Number of live connections across all users.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    /// Record activity on a connection.
    pub fn touch(&self, connection_id: &ConnectionId) {
        let Some(user) = self.owner_of(connection_id) else {
            return;
        };
        if let Some(mut conns) = self.users.get_mut(&user) {
            if let Some(state) = conns.get_mut(connection_id) {
                state.touch();
            }
        }
    }

    /// Handles that have been silent for longer than `timeout`.
    #[must_use]
    pub fn stale_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.users
            .iter()
            .flat_map(|entry| {
                entry
                    .values()
                    .filter(|s| s.is_stale(timeout))
                    .map(|s| s.connection_id.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_multi_device_presence() {
        let registry = PresenceRegistry::new();
        let alice = UserId::from("alice");

        assert_eq!(
            registry.add_connection(&alice, &"phone".into()),
            PresenceChange::CameOnline
        );
        assert_eq!(
            registry.add_connection(&alice, &"laptop".into()),
            PresenceChange::AdditionalDevice
        );
        assert_eq!(
            registry.add_connection(&alice, &"phone".into()),
            PresenceChange::Duplicate
        );
        assert_eq!(registry.connections_for(&alice).len(), 2);

        let first = registry.remove_connection(&"phone".into()).unwrap();
        assert!(!first.went_offline);
        assert!(registry.is_online(&alice));

        let last = registry.remove_connection(&"laptop".into()).unwrap();
        assert!(last.went_offline);
        assert!(!registry.is_online(&alice));
        assert!(registry.connections_for(&alice).is_empty());
    }

    #[test]
    fn test_remove_unknown_connection() {
        let registry = PresenceRegistry::new();
        assert!(registry.remove_connection(&"ghost".into()).is_none());
    }

    #[test]
    fn test_handle_reassigned_to_other_user() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::from("c1");
        registry.add_connection(&"alice".into(), &conn);
        registry.add_connection(&"bob".into(), &conn);

        assert!(!registry.is_online(&"alice".into()));
        assert_eq!(registry.owner_of(&conn), Some("bob".into()));
    }

    #[test]
    fn test_stale_connections() {
        let registry = PresenceRegistry::new();
        registry.add_connection(&"alice".into(), &"c1".into());

        assert!(registry.stale_connections(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.stale_connections(Duration::from_millis(1)).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connect_disconnect_leaves_consistent_state() {
        let registry = Arc::new(PresenceRegistry::new());
        let user = UserId::from("alice");

        let mut handles = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                let conn = ConnectionId::new(format!("c{i}"));
                registry.add_connection(&user, &conn);
                if i % 2 == 0 {
                    registry.remove_connection(&conn);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(registry.connections_for(&user).len(), 32);
        assert_eq!(registry.connection_count(), 32);
        assert!(registry.is_online(&user));
    }
}
