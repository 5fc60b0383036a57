//! Persistence seams.
//!
//! Repositories store whole documents and guard writes with the document
//! `version`: `replace` succeeds only if the stored version still equals the
//! one the caller read, and bumps it. The two identity-sensitive writes
//! (direct conversation creation and notification grouping) are single
//! atomic upserts.

pub mod memory;

use crate::error::CoreError;
use crate::ids::{ConversationId, MessageId, NotificationId, UserId};
use crate::model::{Conversation, Message, Notification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;

/// Upper bound on any page size.
pub const MAX_PAGE_SIZE: usize = 100;

/// List pagination: by timestamp cursor or by page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    /// Items strictly older than `before` (newest first).
    Cursor {
        before: Option<DateTime<Utc>>,
        limit: usize,
    },
    /// Zero-based page of `limit` items (newest first).
    Offset { page: usize, limit: usize },
}

impl Page {
    #[must_use]
    pub fn latest(limit: usize) -> Self {
        Page::Cursor {
            before: None,
            limit,
        }
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn limit(&self) -> usize {
        let limit = match self {
            Page::Cursor { limit, .. } | Page::Offset { limit, .. } => *limit,
        };
        limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Apply this page to a newest-first sequence.
    pub fn apply<T, I, F>(&self, newest_first: I, created_at: F) -> Vec<T>
    where
        I: Iterator<Item = T>,
        F: Fn(&T) -> DateTime<Utc>,
    {
        let limit = self.limit();
        match *self {
            Page::Cursor { before, .. } => newest_first
                .filter(|item| before.map_or(true, |b| created_at(item) < b))
                .take(limit)
                .collect(),
            Page::Offset { page, .. } => newest_first.skip(page * limit).take(limit).collect(),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::latest(50)
    }
}

/// Outcome of a grouped notification upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupedUpsert {
    Created(Notification),
    Merged(Notification),
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Return the direct conversation for `direct_id`, creating it from
    /// `candidate` if none exists. Atomic per key.
    async fn upsert_direct(&self, candidate: Conversation) -> Result<Conversation, CoreError>;

    async fn insert(&self, conversation: Conversation) -> Result<Conversation, CoreError>;

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, CoreError>;

    /// Compare-and-swap on `version`.
    async fn replace(&self, conversation: Conversation) -> Result<Conversation, CoreError>;

    /// Conversations `user` belongs to, most recently active first.
    async fn list_for_user(&self, user: &UserId) -> Result<Vec<Conversation>, CoreError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Append to the conversation thread. Thread order is insert order.
    async fn insert(&self, message: Message) -> Result<Message, CoreError>;

    /// Remove a message. Used only to roll back a failed send.
    async fn remove(&self, id: MessageId) -> Result<(), CoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<Message>, CoreError>;

    /// Compare-and-swap on `version`.
    async fn replace(&self, message: Message) -> Result<Message, CoreError>;

    /// Page of the thread as seen by `viewer` (hidden messages excluded).
    async fn list(
        &self,
        conversation: ConversationId,
        viewer: &UserId,
        page: Page,
    ) -> Result<Vec<Message>, CoreError>;

    /// Ids of messages not authored by `user` and not yet seen by them.
    async fn unseen_by(
        &self,
        conversation: ConversationId,
        user: &UserId,
    ) -> Result<Vec<MessageId>, CoreError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Atomically merge `candidate`'s sender into an unread notification
    /// with the same (recipient, group key) updated since `window_start`,
    /// or insert `candidate` as a new record.
    async fn upsert_grouped(
        &self,
        candidate: Notification,
        window_start: DateTime<Utc>,
    ) -> Result<GroupedUpsert, CoreError>;

    async fn insert(&self, notification: Notification) -> Result<Notification, CoreError>;

    /// Unordered bulk insert. Returns how many were stored.
    async fn insert_many(&self, notifications: Vec<Notification>) -> Result<usize, CoreError>;

    async fn get(&self, id: NotificationId) -> Result<Option<Notification>, CoreError>;

    async fn list(&self, recipient: &UserId, page: Page) -> Result<Vec<Notification>, CoreError>;

    async fn unread_count(&self, recipient: &UserId) -> Result<usize, CoreError>;

    /// Returns `false` if no such notification belongs to `recipient`.
    async fn mark_read(&self, recipient: &UserId, id: NotificationId) -> Result<bool, CoreError>;

    /// Returns how many were flipped to read.
    async fn mark_all_read(&self, recipient: &UserId) -> Result<usize, CoreError>;

    async fn delete(&self, recipient: &UserId, id: NotificationId) -> Result<bool, CoreError>;

    /// Remove `sender` from the grouped notification, deleting it when no
    /// sender is left. Returns the remaining record, if any.
    async fn retract_sender(
        &self,
        recipient: &UserId,
        group_key: &str,
        sender: &UserId,
    ) -> Result<Option<Notification>, CoreError>;

    /// Drop notifications whose `expires_at` is at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_page_limit_is_clamped() {
        assert_eq!(Page::latest(0).limit(), 1);
        assert_eq!(Page::Offset { page: 0, limit: 500 }.limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_page_apply() {
        let now = Utc::now();
        let items: Vec<DateTime<Utc>> = (0..10).map(|i| now - Duration::seconds(i)).collect();

        let cursor = Page::Cursor {
            before: Some(now - Duration::seconds(4)),
            limit: 3,
        };
        let got = cursor.apply(items.iter().copied(), |t| *t);
        assert_eq!(got, items[5..8].to_vec());

        let offset = Page::Offset { page: 2, limit: 4 };
        let got = offset.apply(items.iter().copied(), |t| *t);
        assert_eq!(got, items[8..10].to_vec());
    }
}
