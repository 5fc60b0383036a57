//! Fixtures shared by the Chorus benchmarks.

use chorus_core::{
    conversation_room, ConnectionId, ConversationId, Envelope, EventSink, Hub, HubConfig,
    InMemoryDirectory, PresenceRegistry, RealtimeTransport, UserId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sink that only counts what it is handed.
#[derive(Debug, Default)]
pub struct CountingSink {
    received: AtomicUsize,
}

impl CountingSink {
    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }
}

impl EventSink for CountingSink {
    fn deliver(&self, _envelope: Arc<Envelope>) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Transport with one user per connection, every connection joined to `room`.
pub fn transport_with_room(room: &str, connections: usize) -> RealtimeTransport {
    let transport = RealtimeTransport::new(Arc::new(PresenceRegistry::new()));
    for i in 0..connections {
        let conn = ConnectionId::new(format!("conn-{i}"));
        transport.register(
            &UserId::new(format!("user-{i}")),
            &conn,
            Arc::new(CountingSink::default()),
        );
        let _ = transport.join(&conn, room);
    }
    transport
}

/// Transport with a single user holding `devices` live connections.
pub fn transport_with_devices(user: &UserId, devices: usize) -> RealtimeTransport {
    let transport = RealtimeTransport::new(Arc::new(PresenceRegistry::new()));
    for i in 0..devices {
        transport.register(
            user,
            &ConnectionId::new(format!("{user}-device-{i}")),
            Arc::new(CountingSink::default()),
        );
    }
    transport
}

/// Hub with a group of `members` users, all online and joined to the
/// group's room. Returns the hub, the group and the sending member.
pub async fn online_group(members: usize) -> (Hub, ConversationId, UserId) {
    let hub = Hub::in_memory(HubConfig::default(), InMemoryDirectory::new());
    let users: Vec<UserId> = (0..members.max(2))
        .map(|i| UserId::new(format!("member-{i}")))
        .collect();
    let sender = users[0].clone();

    let group = hub
        .conversations()
        .create_group(&sender, users.iter().cloned(), Some("bench".into()), None)
        .await
        .expect("group creation");

    for user in &users {
        let conn = ConnectionId::new(format!("{user}-conn"));
        hub.connect(user, &conn, Arc::new(CountingSink::default()))
            .await;
        hub.transport()
            .join(&conn, &conversation_room(&group.id))
            .expect("join group room");
    }

    (hub, group.id, sender)
}

/// Hub whose `star` user has `followers` followers.
pub fn celebrity(star: &UserId, followers: usize) -> Hub {
    let directory = InMemoryDirectory::new();
    for i in 0..followers {
        directory.follow(&UserId::new(format!("fan-{i}")), star);
    }
    Hub::in_memory(HubConfig::default(), directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_fixture_joins_everyone() {
        let transport = transport_with_room("lobby", 10);
        assert_eq!(transport.room_size("lobby"), 10);
        assert_eq!(transport.stats().online_users, 10);
    }

    #[tokio::test]
    async fn test_online_group_fixture() {
        let (hub, group, sender) = online_group(5).await;
        assert_eq!(hub.transport().room_size(&conversation_room(&group)), 5);
        assert!(hub.is_online(&sender));
    }
}
