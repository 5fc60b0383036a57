//! In-process repositories backed by `DashMap`.
//!
//! Identity-sensitive upserts hold the shard lock of their index entry for
//! the whole find-or-create, which is what makes them atomic. Secondary
//! indexes are always locked before the documents they point at, never the
//! other way around.

use super::{
    ConversationRepository, GroupedUpsert, MessageRepository, NotificationRepository, Page,
};
use crate::error::CoreError;
use crate::ids::{ConversationId, MessageId, NotificationId, UserId};
use crate::model::{Conversation, Message, Notification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

/// All three repositories in one in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Conversation>,
    direct_index: DashMap<String, ConversationId>,
    messages: DashMap<MessageId, Message>,
    threads: DashMap<ConversationId, Vec<MessageId>>,
    notifications: DashMap<NotificationId, Notification>,
    inbox: DashMap<UserId, Vec<NotificationId>>,
    groups: DashMap<(UserId, String), NotificationId>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    #[must_use]
    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }

    fn store_notification(&self, notification: Notification) {
        let id = notification.id;
        let recipient = notification.recipient.clone();
        self.notifications.insert(id, notification);
        self.inbox.entry(recipient).or_default().push(id);
    }

    fn drop_notification(&self, id: NotificationId) -> Option<Notification> {
        let (_, removed) = self.notifications.remove(&id)?;
        if let Some(key) = removed.group_key.clone() {
            self.groups
                .remove_if(&(removed.recipient.clone(), key), |_, current| *current == id);
        }
        if let Some(mut ids) = self.inbox.get_mut(&removed.recipient) {
            ids.retain(|n| *n != id);
        }
        Some(removed)
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn upsert_direct(&self, candidate: Conversation) -> Result<Conversation, CoreError> {
        let key = candidate
            .direct_id
            .clone()
            .ok_or_else(|| CoreError::InvalidTarget("direct conversation without key".into()))?;

        match self.direct_index.entry(key) {
            Entry::Occupied(existing) => self
                .conversations
                .get(existing.get())
                .map(|c| c.clone())
                .ok_or_else(|| CoreError::not_found("conversation", existing.get())),
            Entry::Vacant(slot) => {
                debug!(conversation = %candidate.id, direct_id = %slot.key(), "Creating direct conversation");
                self.conversations.insert(candidate.id, candidate.clone());
                slot.insert(candidate.id);
                Ok(candidate)
            }
        }
    }

    async fn insert(&self, conversation: Conversation) -> Result<Conversation, CoreError> {
        match self.conversations.entry(conversation.id) {
            Entry::Occupied(_) => Err(CoreError::Conflict(conversation.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(conversation.clone());
                Ok(conversation)
            }
        }
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, CoreError> {
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    async fn replace(&self, conversation: Conversation) -> Result<Conversation, CoreError> {
        let mut stored = self
            .conversations
            .get_mut(&conversation.id)
            .ok_or_else(|| CoreError::not_found("conversation", conversation.id))?;
        if stored.version != conversation.version {
            trace!(conversation = %conversation.id, "Stale conversation write");
            return Err(CoreError::Conflict(conversation.id.to_string()));
        }
        let mut next = conversation;
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_for_user(&self, user: &UserId) -> Result<Vec<Conversation>, CoreError> {
        let mut found: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.is_member(user) && !c.is_archived())
            .map(|c| c.clone())
            .collect();
        found.sort_by_key(|c| std::cmp::Reverse(c.last_activity()));
        Ok(found)
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert(&self, message: Message) -> Result<Message, CoreError> {
        let id = message.id;
        let conversation = message.conversation_id;
        match self.messages.entry(id) {
            Entry::Occupied(_) => return Err(CoreError::Conflict(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(message.clone());
            }
        }
        self.threads.entry(conversation).or_default().push(id);
        Ok(message)
    }

    async fn remove(&self, id: MessageId) -> Result<(), CoreError> {
        if let Some((_, removed)) = self.messages.remove(&id) {
            if let Some(mut thread) = self.threads.get_mut(&removed.conversation_id) {
                thread.retain(|m| *m != id);
            }
        }
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, CoreError> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn replace(&self, message: Message) -> Result<Message, CoreError> {
        let mut stored = self
            .messages
            .get_mut(&message.id)
            .ok_or_else(|| CoreError::not_found("message", message.id))?;
        if stored.version != message.version {
            trace!(message = %message.id, "Stale message write");
            return Err(CoreError::Conflict(message.id.to_string()));
        }
        let mut next = message;
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list(
        &self,
        conversation: ConversationId,
        viewer: &UserId,
        page: Page,
    ) -> Result<Vec<Message>, CoreError> {
        let Some(thread) = self.threads.get(&conversation) else {
            return Ok(Vec::new());
        };
        let newest_first = thread
            .iter()
            .rev()
            .filter_map(|id| self.messages.get(id).map(|m| m.clone()))
            .filter(|m| !m.is_hidden_for(viewer));
        Ok(page.apply(newest_first, |m| m.created_at))
    }

    async fn unseen_by(
        &self,
        conversation: ConversationId,
        user: &UserId,
    ) -> Result<Vec<MessageId>, CoreError> {
        let Some(thread) = self.threads.get(&conversation) else {
            return Ok(Vec::new());
        };
        Ok(thread
            .iter()
            .filter(|id| {
                self.messages
                    .get(*id)
                    .is_some_and(|m| &m.sender != user && !m.seen_by_user(user))
            })
            .copied()
            .collect())
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn upsert_grouped(
        &self,
        candidate: Notification,
        window_start: DateTime<Utc>,
    ) -> Result<GroupedUpsert, CoreError> {
        let key = candidate
            .group_key
            .clone()
            .ok_or_else(|| CoreError::InvalidTarget("grouped notification without key".into()))?;
        let now = candidate.updated_at;

        match self.groups.entry((candidate.recipient.clone(), key)) {
            Entry::Occupied(mut slot) => {
                if let Some(mut existing) = self.notifications.get_mut(slot.get()) {
                    if existing.accepts_merge(window_start, now) {
                        existing.merge_sender(&candidate.sender, now);
                        return Ok(GroupedUpsert::Merged(existing.clone()));
                    }
                }
                // Read, expired or out of window: start a fresh group record.
                slot.insert(candidate.id);
                self.store_notification(candidate.clone());
                Ok(GroupedUpsert::Created(candidate))
            }
            Entry::Vacant(slot) => {
                slot.insert(candidate.id);
                self.store_notification(candidate.clone());
                Ok(GroupedUpsert::Created(candidate))
            }
        }
    }

    async fn insert(&self, notification: Notification) -> Result<Notification, CoreError> {
        self.store_notification(notification.clone());
        Ok(notification)
    }

    async fn insert_many(&self, notifications: Vec<Notification>) -> Result<usize, CoreError> {
        let count = notifications.len();
        for n in notifications {
            self.store_notification(n);
        }
        Ok(count)
    }

    async fn get(&self, id: NotificationId) -> Result<Option<Notification>, CoreError> {
        Ok(self.notifications.get(&id).map(|n| n.clone()))
    }

    async fn list(&self, recipient: &UserId, page: Page) -> Result<Vec<Notification>, CoreError> {
        let Some(ids) = self.inbox.get(recipient) else {
            return Ok(Vec::new());
        };
        let newest_first = ids
            .iter()
            .rev()
            .filter_map(|id| self.notifications.get(id).map(|n| n.clone()));
        Ok(page.apply(newest_first, |n| n.created_at))
    }

    async fn unread_count(&self, recipient: &UserId) -> Result<usize, CoreError> {
        Ok(self.inbox.get(recipient).map_or(0, |ids| {
            ids.iter()
                .filter(|id| self.notifications.get(*id).is_some_and(|n| !n.is_read))
                .count()
        }))
    }

    async fn mark_read(&self, recipient: &UserId, id: NotificationId) -> Result<bool, CoreError> {
        match self.notifications.get_mut(&id) {
            Some(mut n) if &n.recipient == recipient => {
                n.is_read = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_all_read(&self, recipient: &UserId) -> Result<usize, CoreError> {
        let ids: Vec<NotificationId> = self
            .inbox
            .get(recipient)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut flipped = 0;
        for id in ids {
            if let Some(mut n) = self.notifications.get_mut(&id) {
                if !n.is_read {
                    n.is_read = true;
                    flipped += 1;
                }
            }
        }
        Ok(flipped)
    }

    async fn delete(&self, recipient: &UserId, id: NotificationId) -> Result<bool, CoreError> {
        let owned = self
            .notifications
            .get(&id)
            .is_some_and(|n| &n.recipient == recipient);
        Ok(owned && self.drop_notification(id).is_some())
    }

    async fn retract_sender(
        &self,
        recipient: &UserId,
        group_key: &str,
        sender: &UserId,
    ) -> Result<Option<Notification>, CoreError> {
        let Some(id) = self
            .groups
            .get(&(recipient.clone(), group_key.to_string()))
            .map(|id| *id)
        else {
            return Ok(None);
        };

        let remaining = match self.notifications.get_mut(&id) {
            Some(mut n) => {
                if n.retract_sender(sender) {
                    None
                } else {
                    Some(n.clone())
                }
            }
            None => return Ok(None),
        };
        if remaining.is_none() {
            self.drop_notification(id);
        }
        Ok(remaining)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let expired: Vec<NotificationId> = self
            .notifications
            .iter()
            .filter(|n| n.expires_at <= now)
            .map(|n| n.id)
            .collect();
        let purged = expired
            .into_iter()
            .filter(|id| self.drop_notification(*id).is_some())
            .count();
        if purged > 0 {
            debug!(purged, "Purged expired notifications");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageStatus, NotificationType};
    use chrono::Duration;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use uuid::Uuid;

    fn message(conversation: ConversationId, sender: &str, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: conversation,
            sender: sender.into(),
            content: content.into(),
            media: Vec::new(),
            status: MessageStatus::Sent,
            seen_by: Vec::new(),
            reactions: Vec::new(),
            reply_to: None,
            is_deleted: false,
            deleted_for: BTreeSet::new(),
            created_at: Utc::now(),
            version: 0,
        }
    }

    fn like(recipient: &str, sender: &str) -> Notification {
        Notification::new(
            recipient.into(),
            sender.into(),
            NotificationType::Like,
            format!("{sender} liked your post"),
            Some("like:post-1".into()),
            None,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_direct_upserts_create_one_conversation() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let candidate = Conversation::direct("alice:bob", "alice".into(), "bob".into());
                store.upsert_direct(candidate).await.unwrap().id
            }));
        }
        let mut ids = BTreeSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn test_replace_rejects_stale_version() {
        let store = MemoryStore::new();
        let conv = Conversation::direct("a:b", "a".into(), "b".into());
        let m = MessageRepository::insert(&store, message(conv.id, "a", "hi"))
            .await
            .unwrap();

        let mut first = m.clone();
        first.content = "edited".into();
        let stored = MessageRepository::replace(&store, first).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut stale = m;
        stale.content = "lost update".into();
        assert!(matches!(
            MessageRepository::replace(&store, stale).await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_thread_order_and_hidden_messages() {
        let store = MemoryStore::new();
        let conv = Uuid::new_v4();
        let bob = UserId::from("bob");

        let mut ids = Vec::new();
        for i in 0..5 {
            let m = MessageRepository::insert(&store, message(conv, "alice", &format!("m{i}")))
                .await
                .unwrap();
            ids.push(m.id);
        }

        let mut hidden = MessageRepository::get(&store, ids[4]).await.unwrap().unwrap();
        hidden.deleted_for.insert(bob.clone());
        MessageRepository::replace(&store, hidden).await.unwrap();

        let page = MessageRepository::list(&store, conv, &bob, Page::latest(3))
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m2", "m1"]);

        let alice_view = MessageRepository::list(&store, conv, &"alice".into(), Page::latest(10))
            .await
            .unwrap();
        assert_eq!(alice_view.len(), 5);

        assert_eq!(store.unseen_by(conv, &bob).await.unwrap(), ids);
        assert!(store.unseen_by(conv, &"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_grouped_upserts_merge_into_one() {
        let store = Arc::new(MemoryStore::new());
        let window_start = Utc::now() - Duration::hours(24);

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert_grouped(like("bob", &format!("fan{}", i % 10)), window_start)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.notification_count(), 1);
        let all = NotificationRepository::list(store.as_ref(), &"bob".into(), Page::default())
            .await
            .unwrap();
        assert_eq!(all[0].group_count, 10);
        assert_eq!(all[0].grouped_senders.len(), 10);
    }

    #[tokio::test]
    async fn test_read_group_starts_new_record() {
        let store = MemoryStore::new();
        let bob = UserId::from("bob");
        let window_start = Utc::now() - Duration::hours(24);

        let first = match store.upsert_grouped(like("bob", "alice"), window_start).await.unwrap() {
            GroupedUpsert::Created(n) => n,
            other => panic!("expected create, got {:?}", other),
        };
        assert!(store.mark_read(&bob, first.id).await.unwrap());

        let second = store.upsert_grouped(like("bob", "carol"), window_start).await.unwrap();
        assert!(matches!(second, GroupedUpsert::Created(_)));
        assert_eq!(store.unread_count(&bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retract_and_purge() {
        let store = MemoryStore::new();
        let bob = UserId::from("bob");
        let window_start = Utc::now() - Duration::hours(24);
        store.upsert_grouped(like("bob", "alice"), window_start).await.unwrap();
        store.upsert_grouped(like("bob", "carol"), window_start).await.unwrap();

        let left = store
            .retract_sender(&bob, "like:post-1", &"alice".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left.group_count, 1);
        assert!(store
            .retract_sender(&bob, "like:post-1", &"carol".into())
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.notification_count(), 0);

        let mut old = like("bob", "dave");
        old.group_key = None;
        old.expires_at = Utc::now() - Duration::seconds(1);
        NotificationRepository::insert(&store, old).await.unwrap();
        NotificationRepository::insert(&store, like("bob", "erin"))
            .await
            .unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.unread_count(&bob).await.unwrap(), 1);
    }
}
