//! Message send, read receipts, reactions and deletion.
//!
//! The persisted store is the source of truth. Realtime events are published
//! after the write succeeds and never hold up the caller; a recipient that
//! misses one reconciles by pulling history or the unread count.

use crate::conversation::ConversationStore;
use crate::error::CoreError;
use crate::ids::{ConversationId, MessageId, UserId};
use crate::model::{Conversation, LastMessage, Message, MessageStatus, SeenEntry};
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::room::conversation_room;
use crate::store::{MessageRepository, Page};
use crate::transport::RealtimeTransport;
use chorus_protocol::EventName;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Message delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// How long after sending the sender may delete for everyone.
    #[serde(default = "default_delete_window")]
    pub delete_window_secs: u64,
    /// Maximum message length in characters.
    #[serde(default = "default_max_content_len")]
    pub max_content_len: usize,
}

fn default_delete_window() -> u64 {
    15 * 60
}

fn default_max_content_len() -> usize {
    5000
}

impl DeliveryConfig {
    /// Delete-for-everyone window. Out-of-range settings saturate.
    #[must_use]
    pub fn delete_window(&self) -> Duration {
        i64::try_from(self.delete_window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delete_window_secs: default_delete_window(),
            max_content_len: default_max_content_len(),
        }
    }
}

/// What a sender submits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDraft {
    pub content: String,
    pub media: Vec<String>,
    pub reply_to: Option<MessageId>,
}

impl MessageDraft {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media.push(url.into());
        self
    }

    #[must_use]
    pub fn replying_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Hide from the caller only.
    ForMe,
    /// Scrub for every member. Sender only, within the delete window.
    ForEveryone,
}

/// Result of [`MessageDeliveryEngine::mark_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub user: UserId,
    /// Messages newly marked by this call. Empty on a repeat call.
    pub message_ids: Vec<MessageId>,
    pub read_at: DateTime<Utc>,
}

pub struct MessageDeliveryEngine {
    conversations: Arc<ConversationStore>,
    messages: Arc<dyn MessageRepository>,
    transport: Arc<RealtimeTransport>,
    config: DeliveryConfig,
    retry: RetryPolicy,
}

impl MessageDeliveryEngine {
    #[must_use]
    pub fn new(
        conversations: Arc<ConversationStore>,
        messages: Arc<dyn MessageRepository>,
        transport: Arc<RealtimeTransport>,
        config: DeliveryConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            conversations,
            messages,
            transport,
            config,
            retry,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    fn check_draft(&self, draft: &MessageDraft) -> Result<(), CoreError> {
        if draft.content.trim().is_empty() && draft.media.is_empty() {
            return Err(CoreError::EmptyMessage);
        }
        if draft.content.chars().count() > self.config.max_content_len {
            return Err(CoreError::ContentTooLong(self.config.max_content_len));
        }
        Ok(())
    }

    /// Send into an existing conversation.
    ///
    /// # Errors
    ///
    /// `NotAMember`, `Policy` for a blocked direct peer, `EmptyMessage`,
    /// `ContentTooLong`, or `Unavailable` if the conversation could not be
    /// updated (the message is rolled back).
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        sender: &UserId,
        draft: MessageDraft,
    ) -> Result<Message, CoreError> {
        let conversation = self
            .conversations
            .find_for_user(conversation_id, sender)
            .await?;
        if !conversation.is_group {
            for peer in conversation.others(sender) {
                self.conversations.check_not_blocked(sender, peer).await?;
            }
        }
        self.deliver(&conversation, sender, draft).await
    }

    /// Send to a user, creating the direct conversation on first contact.
    pub async fn send_direct(
        &self,
        sender: &UserId,
        recipient: &UserId,
        draft: MessageDraft,
    ) -> Result<Message, CoreError> {
        self.check_draft(&draft)?;
        let conversation = self.conversations.resolve_direct(sender, recipient).await?;
        self.deliver(&conversation, sender, draft).await
    }

    async fn deliver(
        &self,
        conversation: &Conversation,
        sender: &UserId,
        draft: MessageDraft,
    ) -> Result<Message, CoreError> {
        self.check_draft(&draft)?;

        let reply_to = match draft.reply_to {
            Some(id) => self.valid_reply(conversation.id, id).await?,
            None => None,
        };

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender: sender.clone(),
            content: draft.content,
            media: draft.media,
            status: MessageStatus::Sent,
            seen_by: vec![SeenEntry {
                user: sender.clone(),
                at: now,
            }],
            reactions: Vec::new(),
            reply_to,
            is_deleted: false,
            deleted_for: BTreeSet::new(),
            created_at: now,
            version: 0,
        };
        let mut message = self.messages.insert(message).await?;

        let last = LastMessage {
            id: message.id,
            sender: sender.clone(),
            preview: message.preview(),
            at: message.created_at,
        };
        if let Err(e) = self.conversations.set_last_message(conversation.id, last).await {
            warn!(conversation = %conversation.id, message = %message.id, error = %e, "Rolling back message");
            if let Err(rollback) = self.messages.remove(message.id).await {
                warn!(message = %message.id, error = %rollback, "Rollback failed");
            }
            return Err(CoreError::Unavailable(format!("message not recorded: {e}")));
        }

        let payload = json!({
            "conversation_id": conversation.id,
            "message": &message,
        });
        let recipients_reached = conversation
            .others(sender)
            .filter(|user| {
                self.transport
                    .publish_to_user(user, EventName::NewMessage, payload.clone())
                    > 0
            })
            .count();
        debug!(
            conversation = %conversation.id,
            message = %message.id,
            recipients_reached,
            "Message sent"
        );

        if recipients_reached > 0 {
            match self
                .modify(message.id, "mark_delivered", |m| {
                    Ok(m.escalate(MessageStatus::Delivered))
                })
                .await
            {
                Ok((updated, _)) => {
                    message = updated;
                    self.transport.publish_to_user(
                        sender,
                        EventName::MessageStatus,
                        json!({
                            "conversation_id": conversation.id,
                            "message_id": message.id,
                            "status": message.status,
                        }),
                    );
                }
                Err(e) => {
                    warn!(message = %message.id, error = %e, "Could not record delivery");
                }
            }
        }

        Ok(message)
    }

    /// Keep a reply reference only if it points into the same conversation.
    async fn valid_reply(
        &self,
        conversation_id: ConversationId,
        reply_to: MessageId,
    ) -> Result<Option<MessageId>, CoreError> {
        match self.messages.get(reply_to).await? {
            Some(target) if target.conversation_id == conversation_id => Ok(Some(reply_to)),
            _ => {
                warn!(conversation = %conversation_id, reply_to = %reply_to, "Dropping invalid reply reference");
                Ok(None)
            }
        }
    }

    /// Re-read, mutate and compare-and-swap a message under the retry policy.
    /// `mutate` returns whether it changed anything; unchanged documents are
    /// not written.
    async fn modify<F>(
        &self,
        id: MessageId,
        op: &str,
        mutate: F,
    ) -> Result<(Message, bool), CoreError>
    where
        F: Fn(&mut Message) -> Result<bool, CoreError> + Send + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict(&self.retry, op, move || async move {
            let mut message = self
                .messages
                .get(id)
                .await?
                .ok_or_else(|| CoreError::not_found("message", id))?;
            if !mutate(&mut message)? {
                return Ok((message, false));
            }
            let stored = self.messages.replace(message).await?;
            Ok((stored, true))
        })
        .await
    }

    /// Load a message and authorize `user` against its conversation.
    async fn authorized_message(
        &self,
        id: MessageId,
        user: &UserId,
    ) -> Result<(Message, Conversation), CoreError> {
        let message = self
            .messages
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found("message", id))?;
        let conversation = self
            .conversations
            .find_for_user(message.conversation_id, user)
            .await?;
        Ok((message, conversation))
    }

    fn publish_to_members(&self, conversation: &Conversation, event: EventName, payload: serde_json::Value) {
        let reached: usize = conversation
            .members
            .iter()
            .map(|member| self.transport.publish_to_user(member, event, payload.clone()))
            .sum();
        trace!(conversation = %conversation.id, event = %event, reached, "Published to members");
    }

    /// Mark every message in the conversation not yet seen by `user` as read.
    /// Repeat calls are no-ops.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<ReadReceipt, CoreError> {
        let conversation = self
            .conversations
            .find_for_user(conversation_id, user)
            .await?;
        let read_at = Utc::now();

        let mut message_ids = Vec::new();
        let mut failure = None;
        for id in self.messages.unseen_by(conversation_id, user).await? {
            let marked = self
                .modify(id, "mark_read", |m| {
                    let seen = m.mark_seen(user, read_at);
                    let escalated = m.escalate(MessageStatus::Read);
                    Ok(seen || escalated)
                })
                .await;
            match marked {
                Ok((_, true)) => message_ids.push(id),
                Ok((_, false)) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if !message_ids.is_empty() {
            let payload = json!({
                "conversation_id": conversation_id,
                "user": user,
                "message_ids": &message_ids,
                "read_at": read_at,
            });
            for peer in conversation.others(user) {
                self.transport
                    .publish_to_user(peer, EventName::ConversationRead, payload.clone());
            }
            debug!(conversation = %conversation_id, user = %user, count = message_ids.len(), "Conversation read");
        }
        // Messages already marked stay marked; peers still hear about them.
        if let Some(e) = failure {
            warn!(conversation = %conversation_id, user = %user, marked = message_ids.len(), error = %e, "Read receipt cut short");
            return Err(e);
        }

        Ok(ReadReceipt {
            conversation_id,
            user: user.clone(),
            message_ids,
            read_at,
        })
    }

    /// Set (`Some`) or clear (`None`) `user`'s reaction. One reaction per
    /// user per message; a new emoji replaces the previous one.
    pub async fn react(
        &self,
        message_id: MessageId,
        user: &UserId,
        emoji: Option<String>,
    ) -> Result<Message, CoreError> {
        let emoji = emoji.map(|e| e.trim().to_string());
        if emoji.as_deref().is_some_and(str::is_empty) {
            return Err(CoreError::InvalidTarget("empty reaction".into()));
        }
        let (_, conversation) = self.authorized_message(message_id, user).await?;

        let (message, _) = self
            .modify(message_id, "react", |m| {
                if m.is_deleted {
                    return Err(CoreError::InvalidTarget("message was deleted".into()));
                }
                m.set_reaction(user, emoji.clone());
                Ok(true)
            })
            .await?;

        self.publish_to_members(
            &conversation,
            EventName::MessageReaction,
            json!({
                "conversation_id": conversation.id,
                "message_id": message_id,
                "user": user,
                "emoji": emoji,
            }),
        );
        Ok(message)
    }

    /// Delete a message for the caller or for everyone.
    ///
    /// # Errors
    ///
    /// `NotSender` or `TooLateToDelete` for an unauthorized or late
    /// delete-for-everyone.
    pub async fn delete(
        &self,
        message_id: MessageId,
        user: &UserId,
        scope: DeleteScope,
    ) -> Result<Message, CoreError> {
        let (_, conversation) = self.authorized_message(message_id, user).await?;

        match scope {
            DeleteScope::ForMe => {
                let (message, _) = self
                    .modify(message_id, "delete_for_me", |m| {
                        Ok(m.deleted_for.insert(user.clone()))
                    })
                    .await?;
                Ok(message)
            }
            DeleteScope::ForEveryone => {
                let window = self.config.delete_window();
                let (message, changed) = self
                    .modify(message_id, "delete_for_everyone", |m| {
                        if &m.sender != user {
                            return Err(CoreError::NotSender);
                        }
                        if m.is_deleted {
                            return Ok(false);
                        }
                        if Utc::now() - m.created_at > window {
                            return Err(CoreError::TooLateToDelete);
                        }
                        m.scrub();
                        Ok(true)
                    })
                    .await?;

                if changed {
                    if let Err(e) = self
                        .conversations
                        .scrub_last_message(conversation.id, message_id)
                        .await
                    {
                        warn!(conversation = %conversation.id, error = %e, "Could not clear last message preview");
                    }
                    self.publish_to_members(
                        &conversation,
                        EventName::MessageDeleted,
                        json!({
                            "conversation_id": conversation.id,
                            "message_id": message_id,
                        }),
                    );
                }
                Ok(message)
            }
        }
    }

    /// Thread page as seen by `viewer`, newest first.
    pub async fn list(
        &self,
        conversation_id: ConversationId,
        viewer: &UserId,
        page: Page,
    ) -> Result<Vec<Message>, CoreError> {
        self.conversations
            .find_for_user(conversation_id, viewer)
            .await?;
        self.messages.list(conversation_id, viewer, page).await
    }

    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<usize, CoreError> {
        self.conversations
            .find_for_user(conversation_id, user)
            .await?;
        Ok(self.messages.unseen_by(conversation_id, user).await?.len())
    }

    /// Relay a typing indicator to the conversation room. Only connections
    /// viewing the conversation receive it. Returns how many it reached.
    pub async fn typing(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
        active: bool,
    ) -> Result<usize, CoreError> {
        self.conversations
            .find_for_user(conversation_id, user)
            .await?;
        let event = if active {
            EventName::Typing
        } else {
            EventName::StopTyping
        };
        Ok(self.transport.publish(
            &conversation_room(&conversation_id),
            event,
            json!({ "conversation_id": conversation_id, "user": user }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::envelope::Envelope;
    use crate::presence::PresenceRegistry;
    use crate::store::{ConversationRepository, MemoryStore};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: Arc<MessageDeliveryEngine>,
        store: Arc<MemoryStore>,
        transport: Arc<RealtimeTransport>,
        directory: InMemoryDirectory,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        fixture_with(store.clone(), store.clone(), store, DeliveryConfig::default())
    }

    fn fixture_with(
        store: Arc<MemoryStore>,
        conversation_repo: Arc<dyn ConversationRepository>,
        message_repo: Arc<dyn MessageRepository>,
        config: DeliveryConfig,
    ) -> Fixture {
        let directory = InMemoryDirectory::new();
        let transport = Arc::new(RealtimeTransport::new(Arc::new(PresenceRegistry::new())));
        let conversations = Arc::new(ConversationStore::new(
            conversation_repo,
            Arc::new(directory.clone()),
            Arc::new(directory.clone()),
            RetryPolicy::default(),
        ));
        let engine = MessageDeliveryEngine::new(
            conversations,
            message_repo,
            transport.clone(),
            config,
            RetryPolicy::default(),
        );
        Fixture {
            engine: Arc::new(engine),
            store,
            transport,
            directory,
        }
    }

    /// Conversations that can be created and read but never updated.
    struct FrozenConversations(Arc<MemoryStore>);

    #[async_trait]
    impl ConversationRepository for FrozenConversations {
        async fn upsert_direct(&self, candidate: Conversation) -> Result<Conversation, CoreError> {
            self.0.upsert_direct(candidate).await
        }

        async fn insert(&self, conversation: Conversation) -> Result<Conversation, CoreError> {
            ConversationRepository::insert(self.0.as_ref(), conversation).await
        }

        async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, CoreError> {
            ConversationRepository::get(self.0.as_ref(), id).await
        }

        async fn replace(&self, _conversation: Conversation) -> Result<Conversation, CoreError> {
            Err(CoreError::Unavailable("conversation store is read-only".into()))
        }

        async fn list_for_user(&self, user: &UserId) -> Result<Vec<Conversation>, CoreError> {
            self.0.list_for_user(user).await
        }
    }

    /// Messages whose content is "stuck" cannot be updated.
    struct StuckMessages(Arc<MemoryStore>);

    #[async_trait]
    impl MessageRepository for StuckMessages {
        async fn insert(&self, message: Message) -> Result<Message, CoreError> {
            MessageRepository::insert(self.0.as_ref(), message).await
        }

        async fn remove(&self, id: MessageId) -> Result<(), CoreError> {
            self.0.remove(id).await
        }

        async fn get(&self, id: MessageId) -> Result<Option<Message>, CoreError> {
            MessageRepository::get(self.0.as_ref(), id).await
        }

        async fn replace(&self, message: Message) -> Result<Message, CoreError> {
            if message.content == "stuck" {
                return Err(CoreError::Unavailable("write timed out".into()));
            }
            MessageRepository::replace(self.0.as_ref(), message).await
        }

        async fn list(
            &self,
            conversation: ConversationId,
            viewer: &UserId,
            page: Page,
        ) -> Result<Vec<Message>, CoreError> {
            MessageRepository::list(self.0.as_ref(), conversation, viewer, page).await
        }

        async fn unseen_by(
            &self,
            conversation: ConversationId,
            user: &UserId,
        ) -> Result<Vec<MessageId>, CoreError> {
            self.0.unseen_by(conversation, user).await
        }
    }

    fn online(transport: &RealtimeTransport, user: &str) -> mpsc::Receiver<Arc<Envelope>> {
        let (tx, rx) = mpsc::channel(32);
        transport.register(&user.into(), &format!("{user}-conn").as_str().into(), Arc::new(tx));
        rx
    }

    fn events(rx: &mut mpsc::Receiver<Arc<Envelope>>) -> Vec<EventName> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(env.event);
        }
        out
    }

    #[tokio::test]
    async fn test_send_to_offline_recipient_stays_sent() {
        let f = fixture();
        let msg = f
            .engine
            .send_direct(&"alice".into(), &"bob".into(), MessageDraft::text("hi"))
            .await
            .unwrap();

        assert_eq!(msg.status, MessageStatus::Sent);
        assert!(msg.seen_by_user(&"alice".into()));
        let conv = ConversationRepository::get(f.store.as_ref(), msg.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conv.last_message.unwrap().id, msg.id);
    }

    #[tokio::test]
    async fn test_send_to_online_recipient_is_delivered() {
        let f = fixture();
        let mut alice = online(&f.transport, "alice");
        let mut bob = online(&f.transport, "bob");

        let msg = f
            .engine
            .send_direct(&"alice".into(), &"bob".into(), MessageDraft::text("hi"))
            .await
            .unwrap();

        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(events(&mut bob), vec![EventName::NewMessage]);
        assert_eq!(events(&mut alice), vec![EventName::MessageStatus]);
    }

    #[tokio::test]
    async fn test_failed_conversation_update_rolls_back_send() {
        let store = Arc::new(MemoryStore::new());
        let f = fixture_with(
            store.clone(),
            Arc::new(FrozenConversations(store.clone())),
            store.clone(),
            DeliveryConfig::default(),
        );
        let alice = UserId::from("alice");
        let mut bob_rx = online(&f.transport, "bob");

        let err = f
            .engine
            .send_direct(&alice, &"bob".into(), MessageDraft::text("lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));

        let conv = &store.list_for_user(&alice).await.unwrap()[0];
        assert!(conv.last_message.is_none());
        assert!(MessageRepository::list(store.as_ref(), conv.id, &alice, Page::default())
            .await
            .unwrap()
            .is_empty());
        assert!(store.unseen_by(conv.id, &"bob".into()).await.unwrap().is_empty());
        assert!(events(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_draft_validation() {
        let f = fixture();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        assert_eq!(
            f.engine.send_direct(&alice, &bob, MessageDraft::text("  ")).await,
            Err(CoreError::EmptyMessage)
        );
        assert_eq!(f.store.conversation_count(), 0);

        let media_only = MessageDraft::default().with_media("s3://bucket/cat.png");
        let msg = f.engine.send_direct(&alice, &bob, media_only).await.unwrap();
        assert_eq!(msg.preview(), "[media]");

        let long = MessageDraft::text("x".repeat(f.engine.config().max_content_len + 1));
        assert!(matches!(
            f.engine.send(msg.conversation_id, &alice, long).await,
            Err(CoreError::ContentTooLong(_))
        ));
        assert!(matches!(
            f.engine
                .send(msg.conversation_id, &"eve".into(), MessageDraft::text("hey"))
                .await,
            Err(CoreError::NotAMember(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_outside_conversation_is_dropped() {
        let f = fixture();
        let alice = UserId::from("alice");
        let elsewhere = f
            .engine
            .send_direct(&alice, &"carol".into(), MessageDraft::text("other"))
            .await
            .unwrap();
        let first = f
            .engine
            .send_direct(&alice, &"bob".into(), MessageDraft::text("one"))
            .await
            .unwrap();

        let ok = f
            .engine
            .send(first.conversation_id, &alice, MessageDraft::text("two").replying_to(first.id))
            .await
            .unwrap();
        assert_eq!(ok.reply_to, Some(first.id));

        let dropped = f
            .engine
            .send(
                first.conversation_id,
                &alice,
                MessageDraft::text("three").replying_to(elsewhere.id),
            )
            .await
            .unwrap();
        assert_eq!(dropped.reply_to, None);
    }

    #[tokio::test]
    async fn test_block_after_conversation_exists() {
        let f = fixture();
        let msg = f
            .engine
            .send_direct(&"alice".into(), &"bob".into(), MessageDraft::text("hi"))
            .await
            .unwrap();
        f.directory.block(&"bob".into(), &"alice".into());

        assert!(matches!(
            f.engine
                .send(msg.conversation_id, &"alice".into(), MessageDraft::text("again"))
                .await,
            Err(CoreError::Policy(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let f = fixture();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let mut alice_rx = online(&f.transport, "alice");

        let m1 = f
            .engine
            .send_direct(&alice, &bob, MessageDraft::text("one"))
            .await
            .unwrap();
        f.engine
            .send(m1.conversation_id, &alice, MessageDraft::text("two"))
            .await
            .unwrap();
        assert_eq!(f.engine.unread_count(m1.conversation_id, &bob).await, Ok(2));

        let receipt = f.engine.mark_read(m1.conversation_id, &bob).await.unwrap();
        assert_eq!(receipt.message_ids.len(), 2);
        assert_eq!(events(&mut alice_rx), vec![EventName::ConversationRead]);

        let again = f.engine.mark_read(m1.conversation_id, &bob).await.unwrap();
        assert!(again.message_ids.is_empty());
        assert!(events(&mut alice_rx).is_empty());

        let stored = MessageRepository::get(f.store.as_ref(), m1.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert_eq!(stored.seen_by.iter().filter(|s| s.user == bob).count(), 1);
        assert_eq!(f.engine.unread_count(m1.conversation_id, &bob).await, Ok(0));
    }

    #[tokio::test]
    async fn test_partial_mark_read_still_notifies_peers() {
        let store = Arc::new(MemoryStore::new());
        let f = fixture_with(
            store.clone(),
            store.clone(),
            Arc::new(StuckMessages(store.clone())),
            DeliveryConfig::default(),
        );
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let mut alice_rx = online(&f.transport, "alice");

        let first = f
            .engine
            .send_direct(&alice, &bob, MessageDraft::text("fine"))
            .await
            .unwrap();
        let conv = first.conversation_id;
        f.engine
            .send(conv, &alice, MessageDraft::text("stuck"))
            .await
            .unwrap();

        assert!(matches!(
            f.engine.mark_read(conv, &bob).await,
            Err(CoreError::Unavailable(_))
        ));

        let receipt = alice_rx.try_recv().unwrap();
        assert_eq!(receipt.event, EventName::ConversationRead);
        assert_eq!(receipt.payload["message_ids"], json!([first.id]));
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(f.engine.unread_count(conv, &bob).await, Ok(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_all_recorded() {
        let f = fixture();
        let alice = UserId::from("alice");
        let readers: Vec<UserId> = (0..8).map(|i| UserId::new(format!("r{i}"))).collect();
        let group = f
            .engine
            .conversations
            .create_group(&alice, readers.clone(), None, None)
            .await
            .unwrap();
        let msg = f
            .engine
            .send(group.id, &alice, MessageDraft::text("all hands"))
            .await
            .unwrap();

        let handles: Vec<_> = readers
            .iter()
            .cloned()
            .map(|reader| {
                let engine = f.engine.clone();
                tokio::spawn(async move { engine.mark_read(group.id, &reader).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let stored = MessageRepository::get(f.store.as_ref(), msg.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.seen_by.len(), 9);
    }

    #[tokio::test]
    async fn test_reactions() {
        let f = fixture();
        let bob = UserId::from("bob");
        let msg = f
            .engine
            .send_direct(&"alice".into(), &bob, MessageDraft::text("hi"))
            .await
            .unwrap();

        f.engine.react(msg.id, &bob, Some("👍".into())).await.unwrap();
        let updated = f.engine.react(msg.id, &bob, Some("🎉".into())).await.unwrap();
        assert_eq!(updated.reactions.len(), 1);
        assert_eq!(updated.reactions[0].emoji, "🎉");

        let cleared = f.engine.react(msg.id, &bob, None).await.unwrap();
        assert!(cleared.reactions.is_empty());

        assert!(matches!(
            f.engine.react(msg.id, &"eve".into(), Some("👀".into())).await,
            Err(CoreError::NotAMember(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_scopes() {
        let f = fixture();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let mut bob_rx = online(&f.transport, "bob");
        let msg = f
            .engine
            .send_direct(&alice, &bob, MessageDraft::text("oops"))
            .await
            .unwrap();

        assert_eq!(
            f.engine.delete(msg.id, &bob, DeleteScope::ForEveryone).await,
            Err(CoreError::NotSender)
        );

        f.engine.delete(msg.id, &bob, DeleteScope::ForMe).await.unwrap();
        assert!(f
            .engine
            .list(msg.conversation_id, &bob, Page::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            f.engine
                .list(msg.conversation_id, &alice, Page::default())
                .await
                .unwrap()
                .len(),
            1
        );

        events(&mut bob_rx);
        let scrubbed = f
            .engine
            .delete(msg.id, &alice, DeleteScope::ForEveryone)
            .await
            .unwrap();
        assert!(scrubbed.is_deleted);
        assert_eq!(scrubbed.id, msg.id);
        assert!(scrubbed.content.is_empty());
        assert_eq!(events(&mut bob_rx), vec![EventName::MessageDeleted]);

        assert!(matches!(
            f.engine.react(msg.id, &bob, Some("👍".into())).await,
            Err(CoreError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_for_everyone_after_window() {
        let f = fixture();
        let alice = UserId::from("alice");
        let msg = f
            .engine
            .send_direct(&alice, &"bob".into(), MessageDraft::text("old news"))
            .await
            .unwrap();

        let mut stored = MessageRepository::get(f.store.as_ref(), msg.id)
            .await
            .unwrap()
            .unwrap();
        stored.created_at = Utc::now() - Duration::minutes(16);
        MessageRepository::replace(f.store.as_ref(), stored).await.unwrap();

        assert_eq!(
            f.engine.delete(msg.id, &alice, DeleteScope::ForEveryone).await,
            Err(CoreError::TooLateToDelete)
        );
    }

    #[tokio::test]
    async fn test_oversized_delete_window_saturates() {
        let store = Arc::new(MemoryStore::new());
        let config = DeliveryConfig {
            delete_window_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.delete_window(), Duration::MAX);
        let f = fixture_with(store.clone(), store.clone(), store, config);
        let alice = UserId::from("alice");
        let msg = f
            .engine
            .send_direct(&alice, &"bob".into(), MessageDraft::text("ancient"))
            .await
            .unwrap();

        let mut stored = MessageRepository::get(f.store.as_ref(), msg.id)
            .await
            .unwrap()
            .unwrap();
        stored.created_at = Utc::now() - Duration::days(3650);
        MessageRepository::replace(f.store.as_ref(), stored).await.unwrap();

        let scrubbed = f
            .engine
            .delete(msg.id, &alice, DeleteScope::ForEveryone)
            .await
            .unwrap();
        assert!(scrubbed.is_deleted);
    }

    #[tokio::test]
    async fn test_history_and_unread_count() {
        let f = fixture();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let first = f
            .engine
            .send_direct(&alice, &bob, MessageDraft::text("m0"))
            .await
            .unwrap();
        let conv = first.conversation_id;
        for i in 1..5 {
            f.engine
                .send(conv, &alice, MessageDraft::text(format!("m{i}")))
                .await
                .unwrap();
        }
        f.engine
            .send(conv, &bob, MessageDraft::text("reply"))
            .await
            .unwrap();

        assert_eq!(f.engine.unread_count(conv, &bob).await, Ok(5));
        assert_eq!(f.engine.unread_count(conv, &alice).await, Ok(1));

        let page = f
            .engine
            .list(conv, &bob, Page::Offset { page: 1, limit: 2 })
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m2"]);

        f.engine.mark_read(conv, &bob).await.unwrap();
        assert_eq!(f.engine.unread_count(conv, &bob).await, Ok(0));
        assert!(matches!(
            f.engine.list(conv, &"eve".into(), Page::default()).await,
            Err(CoreError::NotAMember(_))
        ));
    }

    #[tokio::test]
    async fn test_typing_relay_reaches_room_only() {
        let f = fixture();
        let mut bob_rx = online(&f.transport, "bob");
        let mut carol_rx = online(&f.transport, "carol");
        let group = f
            .engine
            .conversations
            .create_group(&"alice".into(), vec![UserId::from("bob"), UserId::from("carol")], None, None)
            .await
            .unwrap();
        f.transport
            .join(&"bob-conn".into(), &conversation_room(&group.id))
            .unwrap();

        assert_eq!(f.engine.typing(group.id, &"alice".into(), true).await, Ok(1));
        assert_eq!(f.engine.typing(group.id, &"alice".into(), false).await, Ok(1));
        assert_eq!(
            events(&mut bob_rx),
            vec![EventName::Typing, EventName::StopTyping]
        );
        assert!(events(&mut carol_rx).is_empty());
        assert!(matches!(
            f.engine.typing(group.id, &"eve".into(), true).await,
            Err(CoreError::NotAMember(_))
        ));
    }
}
