//! Persisted document shapes.
//!
//! Every document carries a `version` that repositories bump on each write;
//! a write against a stale version is rejected as a conflict.

use crate::ids::{ConversationId, MessageId, NotificationId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Pointer from a conversation to its most recent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub preview: String,
    pub at: DateTime<Utc>,
}

/// A direct (1:1) or group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub members: BTreeSet<UserId>,
    /// Present for groups while they have members.
    pub admin: Option<UserId>,
    /// Canonical sorted-pair key, only for direct conversations.
    pub direct_id: Option<String>,
    pub last_message: Option<LastMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when a group is deleted or loses its last member. Never hard-deleted.
    pub archived_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Conversation {
    /// Build a direct conversation for a canonical pair.
    #[must_use]
    pub fn direct(direct_id: impl Into<String>, a: UserId, b: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            is_group: false,
            name: None,
            avatar: None,
            members: [a, b].into_iter().collect(),
            admin: None,
            direct_id: Some(direct_id.into()),
            last_message: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
            version: 0,
        }
    }

    /// Build a group with `admin` as its administrator.
    #[must_use]
    pub fn group(
        admin: UserId,
        members: BTreeSet<UserId>,
        name: Option<String>,
        avatar: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            is_group: true,
            name,
            avatar,
            members,
            admin: Some(admin),
            direct_id: None,
            last_message: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
            version: 0,
        }
    }

    #[must_use]
    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Ordering and cursor key for conversation lists: the later of the
    /// last message and the last membership or profile change.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map_or(self.updated_at, |m| m.at.max(self.updated_at))
    }

    /// Members other than `user`.
    pub fn others<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.members.iter().filter(move |m| *m != user)
    }
}

/// Delivery status. Ordered so that status updates can only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    pub user: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user: UserId,
    pub emoji: String,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub content: String,
    pub media: Vec<String>,
    pub status: MessageStatus,
    pub seen_by: Vec<SeenEntry>,
    pub reactions: Vec<Reaction>,
    pub reply_to: Option<MessageId>,
    pub is_deleted: bool,
    pub deleted_for: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Message {
    /// Raise the status; never lowers it.
    pub fn escalate(&mut self, status: MessageStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn seen_by_user(&self, user: &UserId) -> bool {
        self.seen_by.iter().any(|s| &s.user == user)
    }

    /// Record that `user` has seen the message. Returns `false` if already recorded.
    pub fn mark_seen(&mut self, user: &UserId, at: DateTime<Utc>) -> bool {
        if self.seen_by_user(user) {
            return false;
        }
        self.seen_by.push(SeenEntry {
            user: user.clone(),
            at,
        });
        true
    }

    /// Replace `user`'s reaction, or clear it with `None`.
    pub fn set_reaction(&mut self, user: &UserId, emoji: Option<String>) {
        self.reactions.retain(|r| &r.user != user);
        if let Some(emoji) = emoji {
            self.reactions.push(Reaction {
                user: user.clone(),
                emoji,
            });
        }
    }

    /// Drop content, media and reactions, keeping the record in the thread.
    pub fn scrub(&mut self) {
        self.content.clear();
        self.media.clear();
        self.reactions.clear();
        self.is_deleted = true;
    }

    #[must_use]
    pub fn is_hidden_for(&self, user: &UserId) -> bool {
        self.deleted_for.contains(user)
    }

    /// Short text used for conversation lists.
    #[must_use]
    pub fn preview(&self) -> String {
        if self.is_deleted {
            return String::new();
        }
        if self.content.is_empty() && !self.media.is_empty() {
            return "[media]".to_string();
        }
        self.content.chars().take(100).collect()
    }
}

/// Notification categories. Each has its own retention and preference toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Like,
    Comment,
    Mention,
    Follow,
    Message,
    NewPost,
    System,
}

impl NotificationType {
    /// How long a notification of this type is kept before the TTL sweep.
    #[must_use]
    pub fn retention(&self) -> Duration {
        let days = match self {
            NotificationType::Like | NotificationType::Message | NotificationType::NewPost => 30,
            NotificationType::Comment | NotificationType::Mention => 60,
            NotificationType::Follow | NotificationType::System => 90,
        };
        Duration::days(days)
    }
}

/// Entity a notification points at (a post, a comment, a profile).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: UserId,
    pub sender: UserId,
    pub kind: NotificationType,
    pub content: String,
    pub related: Option<RelatedEntity>,
    pub group_key: Option<String>,
    /// Distinct senders merged into this record, in arrival order.
    pub grouped_senders: Vec<UserId>,
    pub group_count: u32,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    /// Last merge; the grouping window rolls from here.
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    #[must_use]
    pub fn new(
        recipient: UserId,
        sender: UserId,
        kind: NotificationType,
        content: String,
        group_key: Option<String>,
        related: Option<RelatedEntity>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            recipient,
            grouped_senders: vec![sender.clone()],
            sender,
            kind,
            content,
            related,
            group_key,
            group_count: 1,
            is_read: false,
            created_at: now,
            updated_at: now,
            expires_at: now + kind.retention(),
        }
    }

    /// Fold another sender into this record. Returns `false` if already present.
    pub fn merge_sender(&mut self, sender: &UserId, at: DateTime<Utc>) -> bool {
        self.updated_at = at;
        if self.grouped_senders.contains(sender) {
            return false;
        }
        self.grouped_senders.push(sender.clone());
        self.group_count = self.grouped_senders.len() as u32;
        self.sender = sender.clone();
        true
    }

    /// Remove a sender. Returns `true` if the record has no senders left.
    pub fn retract_sender(&mut self, sender: &UserId) -> bool {
        self.grouped_senders.retain(|s| s != sender);
        self.group_count = self.grouped_senders.len() as u32;
        if let Some(last) = self.grouped_senders.last() {
            self.sender = last.clone();
        }
        self.grouped_senders.is_empty()
    }

    /// Whether a new event with the same group key may merge into this record.
    #[must_use]
    pub fn accepts_merge(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        !self.is_read && self.updated_at >= window_start && self.expires_at > now
    }
}
