//! Lookups consumed from the rest of the platform: user settings (blocks,
//! mutes, notification toggles, messaging policy) and the social graph.

use crate::error::CoreError;
use crate::ids::UserId;
use crate::model::NotificationType;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Who may open a direct conversation with a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingPolicy {
    #[default]
    Everyone,
    /// Only users who follow the recipient.
    FollowersOnly,
    Nobody,
}

/// Settings of one user, as seen by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub blocked: HashSet<UserId>,
    pub muted: HashSet<UserId>,
    pub disabled_notifications: HashSet<NotificationType>,
    pub messaging: MessagingPolicy,
}

impl UserPreferences {
    #[must_use]
    pub fn blocks(&self, other: &UserId) -> bool {
        self.blocked.contains(other)
    }

    /// Blocked or muted: no notifications from `other`.
    #[must_use]
    pub fn silences(&self, other: &UserId) -> bool {
        self.blocked.contains(other) || self.muted.contains(other)
    }

    #[must_use]
    pub fn wants(&self, kind: NotificationType) -> bool {
        !self.disabled_notifications.contains(&kind)
    }
}

/// Read-only settings lookups.
#[async_trait]
pub trait UserSettings: Send + Sync {
    /// Settings for one user. Unknown users get defaults.
    async fn preferences(&self, user: &UserId) -> Result<UserPreferences, CoreError>;

    /// Settings for a batch of users in one round trip.
    async fn preferences_batch(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, UserPreferences>, CoreError>;
}

/// Social graph lookups.
#[async_trait]
pub trait SocialGraph: Send + Sync {
    /// Cursor over the followers of `user`. Implementations must page
    /// through storage rather than load the whole list.
    fn followers(&self, user: &UserId) -> BoxStream<'static, Result<UserId, CoreError>>;

    async fn is_following(&self, follower: &UserId, followee: &UserId) -> Result<bool, CoreError>;
}

/// Page size used by the in-memory follower cursor.
const CURSOR_PAGE: usize = 256;

/// In-process directory backing both lookups. Used by the server when no
/// external services are configured, and by tests.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDirectory {
    /// followee -> followers, in follow order.
    followers: Arc<DashMap<UserId, Vec<UserId>>>,
    preferences: Arc<DashMap<UserId, UserPreferences>>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(&self, follower: &UserId, followee: &UserId) {
        let mut list = self.followers.entry(followee.clone()).or_default();
        if !list.contains(follower) {
            list.push(follower.clone());
        }
    }

    pub fn block(&self, user: &UserId, other: &UserId) {
        self.preferences
            .entry(user.clone())
            .or_default()
            .blocked
            .insert(other.clone());
    }

    pub fn mute(&self, user: &UserId, other: &UserId) {
        self.preferences
            .entry(user.clone())
            .or_default()
            .muted
            .insert(other.clone());
    }

    pub fn disable_notifications(&self, user: &UserId, kind: NotificationType) {
        self.preferences
            .entry(user.clone())
            .or_default()
            .disabled_notifications
            .insert(kind);
    }

    pub fn set_messaging_policy(&self, user: &UserId, policy: MessagingPolicy) {
        self.preferences.entry(user.clone()).or_default().messaging = policy;
    }

    fn lookup(&self, user: &UserId) -> UserPreferences {
        self.preferences
            .get(user)
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UserSettings for InMemoryDirectory {
    async fn preferences(&self, user: &UserId) -> Result<UserPreferences, CoreError> {
        Ok(self.lookup(user))
    }

    async fn preferences_batch(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, UserPreferences>, CoreError> {
        Ok(users.iter().map(|u| (u.clone(), self.lookup(u))).collect())
    }
}

#[async_trait]
impl SocialGraph for InMemoryDirectory {
    fn followers(&self, user: &UserId) -> BoxStream<'static, Result<UserId, CoreError>> {
        let followers = Arc::clone(&self.followers);
        let user = user.clone();

        stream::unfold(0usize, move |offset| {
            let followers = Arc::clone(&followers);
            let user = user.clone();
            async move {
                let page: Vec<UserId> = followers
                    .get(&user)
                    .map(|f| f.iter().skip(offset).take(CURSOR_PAGE).cloned().collect())
                    .unwrap_or_default();
                if page.is_empty() {
                    None
                } else {
                    let next = offset + page.len();
                    Some((stream::iter(page.into_iter().map(Ok)), next))
                }
            }
        })
        .flatten()
        .boxed()
    }

    async fn is_following(&self, follower: &UserId, followee: &UserId) -> Result<bool, CoreError> {
        Ok(self
            .followers
            .get(followee)
            .is_some_and(|f| f.contains(follower)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[tokio::test]
    async fn test_follower_cursor_pages_through_everyone() {
        let dir = InMemoryDirectory::new();
        let star = UserId::from("star");
        for i in 0..(CURSOR_PAGE * 2 + 10) {
            dir.follow(&UserId::new(format!("fan{i}")), &star);
        }
        dir.follow(&"fan0".into(), &star);

        let all: Vec<UserId> = dir.followers(&star).try_collect().await.unwrap();
        assert_eq!(all.len(), CURSOR_PAGE * 2 + 10);
        assert_eq!(all[0], UserId::from("fan0"));
        assert!(dir.is_following(&"fan3".into(), &star).await.unwrap());
        assert!(!dir.is_following(&star, &"fan3".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_preferences() {
        let dir = InMemoryDirectory::new();
        let bob = UserId::from("bob");
        dir.block(&bob, &"mallory".into());
        dir.mute(&bob, &"carol".into());
        dir.disable_notifications(&bob, NotificationType::Like);

        let prefs = dir.preferences(&bob).await.unwrap();
        assert!(prefs.blocks(&"mallory".into()));
        assert!(prefs.silences(&"carol".into()));
        assert!(!prefs.blocks(&"carol".into()));
        assert!(!prefs.wants(NotificationType::Like));
        assert!(prefs.wants(NotificationType::Comment));

        let batch = dir
            .preferences_batch(&[bob.clone(), "stranger".into()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[&UserId::from("stranger")], UserPreferences::default());
    }
}
