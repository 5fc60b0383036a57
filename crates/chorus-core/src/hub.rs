//! Wiring of the realtime transport, stores and engines, plus the
//! connection lifecycle: presence announcements and conversation rooms.

use crate::conversation::ConversationStore;
use crate::delivery::{DeliveryConfig, MessageDeliveryEngine};
use crate::directory::{InMemoryDirectory, SocialGraph, UserSettings};
use crate::error::CoreError;
use crate::ids::{ConnectionId, ConversationId, UserId};
use crate::model::Conversation;
use crate::notification::{NotificationConfig, NotificationEngine};
use crate::presence::{Departure, PresenceChange, PresenceRegistry};
use crate::retry::RetryPolicy;
use crate::room::conversation_room;
use crate::store::{
    ConversationRepository, MemoryStore, MessageRepository, NotificationRepository,
};
use crate::transport::{EventSink, RealtimeTransport, TransportConfig};
use chorus_protocol::EventName;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration of every core component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Storage backends the hub runs on.
pub struct Repositories {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
}

impl Repositories {
    /// All three backed by one [`MemoryStore`].
    #[must_use]
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            conversations: store.clone(),
            messages: store.clone(),
            notifications: store,
        }
    }
}

/// The messaging core of one node.
pub struct Hub {
    transport: Arc<RealtimeTransport>,
    conversation_repo: Arc<dyn ConversationRepository>,
    conversations: Arc<ConversationStore>,
    messages: Arc<MessageDeliveryEngine>,
    notifications: Arc<NotificationEngine>,
}

impl Hub {
    #[must_use]
    pub fn new(
        config: HubConfig,
        repos: Repositories,
        settings: Arc<dyn UserSettings>,
        graph: Arc<dyn SocialGraph>,
    ) -> Self {
        let transport = Arc::new(RealtimeTransport::with_config(
            Arc::new(PresenceRegistry::new()),
            config.transport,
        ));
        let conversations = Arc::new(ConversationStore::new(
            repos.conversations.clone(),
            settings.clone(),
            graph.clone(),
            config.retry.clone(),
        ));
        let messages = Arc::new(MessageDeliveryEngine::new(
            conversations.clone(),
            repos.messages,
            transport.clone(),
            config.delivery,
            config.retry,
        ));
        let notifications = Arc::new(NotificationEngine::new(
            repos.notifications,
            settings,
            graph,
            transport.clone(),
            config.notifications,
        ));
        info!("Messaging hub ready");

        Self {
            transport,
            conversation_repo: repos.conversations,
            conversations,
            messages,
            notifications,
        }
    }

    /// Hub over in-memory storage and an in-process directory.
    #[must_use]
    pub fn in_memory(config: HubConfig, directory: InMemoryDirectory) -> Self {
        let directory = Arc::new(directory);
        Self::new(
            config,
            Repositories::in_memory(Arc::new(MemoryStore::new())),
            directory.clone(),
            directory,
        )
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<RealtimeTransport> {
        &self.transport
    }

    #[must_use]
    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    #[must_use]
    pub fn messages(&self) -> &Arc<MessageDeliveryEngine> {
        &self.messages
    }

    #[must_use]
    pub fn notifications(&self) -> &Arc<NotificationEngine> {
        &self.notifications
    }

    /// Register a live connection. Conversation peers are told when the
    /// user comes online.
    pub async fn connect(
        &self,
        user: &UserId,
        connection_id: &ConnectionId,
        sink: Arc<dyn EventSink>,
    ) -> PresenceChange {
        let change = self.transport.register(user, connection_id, sink);
        if change == PresenceChange::CameOnline {
            self.announce_status(user, true).await;
        }
        change
    }

    /// Drop a connection. Conversation peers are told when it was the
    /// user's last one.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Option<Departure> {
        let departure = self.transport.disconnect(connection_id)?;
        if departure.went_offline {
            self.announce_status(&departure.user, false).await;
        }
        Some(departure)
    }

    /// Drop connections silent for longer than `timeout`.
    pub async fn prune_stale(&self, timeout: Duration) -> Vec<Departure> {
        let departures = self.transport.prune_stale(timeout);
        for departure in departures.iter().filter(|d| d.went_offline) {
            self.announce_status(&departure.user, false).await;
        }
        if !departures.is_empty() {
            debug!(count = departures.len(), "Pruned stale connections");
        }
        departures
    }

    async fn announce_status(&self, user: &UserId, online: bool) {
        let conversations = match self.conversation_repo.list_for_user(user).await {
            Ok(c) => c,
            Err(e) => {
                warn!(user = %user, error = %e, "Could not load peers for status change");
                return;
            }
        };
        let peers: BTreeSet<&UserId> = conversations.iter().flat_map(|c| c.others(user)).collect();
        let payload = json!({ "user": user, "online": online, "at": Utc::now() });
        for peer in &peers {
            self.transport
                .publish_to_user(peer, EventName::UserStatusChange, payload.clone());
        }
        debug!(user = %user, online, peers = peers.len(), "Announced status change");
    }

    /// Subscribe a connection to a conversation's room. Members only.
    pub async fn join_conversation(
        &self,
        connection_id: &ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<bool, CoreError> {
        let user = self
            .transport
            .user_of(connection_id)
            .ok_or_else(|| CoreError::not_found("connection", connection_id))?;
        self.conversations
            .find_for_user(conversation_id, &user)
            .await?;
        Ok(self
            .transport
            .join(connection_id, &conversation_room(&conversation_id))?)
    }

    /// Remove `target` from a group and take their connections out of the
    /// conversation room.
    pub async fn remove_member(
        &self,
        conversation_id: ConversationId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<Conversation, CoreError> {
        let updated = self
            .conversations
            .remove_member(conversation_id, actor, target)
            .await?;
        self.transport
            .remove_user_from_room(target, &conversation_room(&conversation_id));
        Ok(updated)
    }

    /// Leave a group and its conversation room.
    pub async fn leave_group(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<Conversation, CoreError> {
        let updated = self.conversations.leave(conversation_id, user).await?;
        self.transport
            .remove_user_from_room(user, &conversation_room(&conversation_id));
        Ok(updated)
    }

    pub fn leave_conversation(
        &self,
        connection_id: &ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<(), CoreError> {
        Ok(self
            .transport
            .leave(connection_id, &conversation_room(&conversation_id))?)
    }

    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.transport.user_of(connection_id)
    }

    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.transport.presence().is_online(user)
    }
}
