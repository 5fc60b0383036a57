//! Conversation identity and membership.
//!
//! Direct conversations are keyed by the canonical sorted pair of their two
//! members and created through an atomic upsert, so two users messaging each
//! other for the first time at the same moment end up in one conversation.
//! Groups always have an admin while they have members; a group that loses
//! its last member is archived and kept.

use crate::directory::{MessagingPolicy, SocialGraph, UserSettings};
use crate::error::CoreError;
use crate::ids::{ConversationId, MessageId, UserId};
use crate::model::{Conversation, LastMessage};
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::store::{ConversationRepository, Page};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Canonical key for the unordered pair `{a, b}`.
///
/// The length prefix keeps ids that contain the separator unambiguous.
#[must_use]
pub fn direct_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}:{}", lo.as_str().len(), lo, hi)
}

/// Editable group fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub name: Option<String>,
    pub avatar: Option<String>,
}

fn clean_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

pub struct ConversationStore {
    repo: Arc<dyn ConversationRepository>,
    settings: Arc<dyn UserSettings>,
    graph: Arc<dyn SocialGraph>,
    retry: RetryPolicy,
}

impl ConversationStore {
    #[must_use]
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        settings: Arc<dyn UserSettings>,
        graph: Arc<dyn SocialGraph>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            settings,
            graph,
            retry,
        }
    }

    /// Reject if either side has blocked the other.
    pub(crate) async fn check_not_blocked(
        &self,
        sender: &UserId,
        recipient: &UserId,
    ) -> Result<(), CoreError> {
        if self.settings.preferences(recipient).await?.blocks(sender) {
            return Err(CoreError::Policy(format!("{recipient} is not accepting your messages")));
        }
        if self.settings.preferences(sender).await?.blocks(recipient) {
            return Err(CoreError::Policy(format!("you have blocked {recipient}")));
        }
        Ok(())
    }

    async fn check_may_open_direct(
        &self,
        sender: &UserId,
        recipient: &UserId,
    ) -> Result<(), CoreError> {
        self.check_not_blocked(sender, recipient).await?;
        match self.settings.preferences(recipient).await?.messaging {
            MessagingPolicy::Everyone => Ok(()),
            MessagingPolicy::FollowersOnly => {
                if self.graph.is_following(sender, recipient).await? {
                    Ok(())
                } else {
                    Err(CoreError::Policy(format!(
                        "{recipient} only accepts messages from followers"
                    )))
                }
            }
            MessagingPolicy::Nobody => Err(CoreError::Policy(format!(
                "{recipient} does not accept direct messages"
            ))),
        }
    }

    /// Find or create the direct conversation between `sender` and `recipient`.
    ///
    /// # Errors
    ///
    /// `InvalidTarget` for self-messaging, `Policy` when blocked or not
    /// permitted by the recipient's messaging setting.
    pub async fn resolve_direct(
        &self,
        sender: &UserId,
        recipient: &UserId,
    ) -> Result<Conversation, CoreError> {
        if sender == recipient {
            return Err(CoreError::InvalidTarget("cannot message yourself".into()));
        }
        self.check_may_open_direct(sender, recipient).await?;

        let key = direct_key(sender, recipient);
        let candidate = Conversation::direct(key, sender.clone(), recipient.clone());
        self.repo.upsert_direct(candidate).await
    }

    /// Create a group with `creator` as admin.
    ///
    /// # Errors
    ///
    /// `InvalidTarget` if the group would have no member besides the creator.
    pub async fn create_group(
        &self,
        creator: &UserId,
        members: impl IntoIterator<Item = UserId>,
        name: Option<String>,
        avatar: Option<String>,
    ) -> Result<Conversation, CoreError> {
        let mut all: BTreeSet<UserId> = members.into_iter().collect();
        all.insert(creator.clone());
        if all.len() < 2 {
            return Err(CoreError::InvalidTarget(
                "a group needs at least one other member".into(),
            ));
        }

        let group = Conversation::group(creator.clone(), all, clean_name(name), avatar);
        info!(conversation = %group.id, admin = %creator, members = group.members.len(), "Group created");
        self.repo.insert(group).await
    }

    /// Live (non-archived) conversation, without authorization.
    pub(crate) async fn find(&self, id: ConversationId) -> Result<Conversation, CoreError> {
        match self.repo.get(id).await? {
            Some(c) if !c.is_archived() => Ok(c),
            _ => Err(CoreError::not_found("conversation", id)),
        }
    }

    /// Authorization gate used by every downstream operation.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent or archived, `NotAMember` otherwise.
    pub async fn find_for_user(
        &self,
        id: ConversationId,
        user: &UserId,
    ) -> Result<Conversation, CoreError> {
        let conversation = self.find(id).await?;
        if !conversation.is_member(user) {
            return Err(CoreError::NotAMember(id));
        }
        Ok(conversation)
    }

    /// Conversations of `user`, most recently active first.
    pub async fn list_for_user(
        &self,
        user: &UserId,
        page: Page,
    ) -> Result<Vec<Conversation>, CoreError> {
        let all = self.repo.list_for_user(user).await?;
        Ok(page.apply(all.into_iter(), Conversation::last_activity))
    }

    /// Re-read, mutate and compare-and-swap under the retry policy.
    async fn modify<F>(
        &self,
        id: ConversationId,
        op: &str,
        mutate: F,
    ) -> Result<Conversation, CoreError>
    where
        F: Fn(&mut Conversation) -> Result<(), CoreError> + Send + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict(&self.retry, op, move || async move {
            let mut conversation = self.find(id).await?;
            mutate(&mut conversation)?;
            conversation.updated_at = Utc::now();
            self.repo.replace(conversation).await
        })
        .await
    }

    /// Add members to a group. Admin only.
    pub async fn add_members(
        &self,
        id: ConversationId,
        actor: &UserId,
        users: &[UserId],
    ) -> Result<Conversation, CoreError> {
        self.modify(id, "add_members", |c| {
            require_admin(c, actor)?;
            c.members.extend(users.iter().cloned());
            Ok(())
        })
        .await
    }

    /// Remove `target` from a group. Admin only, unless removing oneself.
    pub async fn remove_member(
        &self,
        id: ConversationId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<Conversation, CoreError> {
        if actor == target {
            return self.leave(id, actor).await;
        }
        self.modify(id, "remove_member", |c| {
            require_admin(c, actor)?;
            if !c.members.remove(target) {
                return Err(CoreError::InvalidTarget(format!("{target} is not a member")));
            }
            Ok(())
        })
        .await
    }

    /// Leave a group. The admin's role passes to another remaining member;
    /// the last member out archives the group.
    pub async fn leave(&self, id: ConversationId, user: &UserId) -> Result<Conversation, CoreError> {
        let updated = self
            .modify(id, "leave", |c| {
                if !c.is_group {
                    return Err(CoreError::InvalidTarget(
                        "cannot leave a direct conversation".into(),
                    ));
                }
                if !c.members.remove(user) {
                    return Err(CoreError::NotAMember(c.id));
                }
                if c.admin.as_ref() == Some(user) {
                    c.admin = c.members.iter().next().cloned();
                }
                if c.members.is_empty() {
                    c.admin = None;
                    c.archived_at = Some(Utc::now());
                }
                Ok(())
            })
            .await?;

        if updated.is_archived() {
            info!(conversation = %id, "Last member left, group archived");
        } else {
            debug!(conversation = %id, user = %user, admin = ?updated.admin, "Member left group");
        }
        Ok(updated)
    }

    /// Rename or re-avatar a group. Admin only.
    pub async fn update(
        &self,
        id: ConversationId,
        actor: &UserId,
        patch: ConversationPatch,
    ) -> Result<Conversation, CoreError> {
        self.modify(id, "update_conversation", |c| {
            require_admin(c, actor)?;
            if patch.name.is_some() {
                c.name = clean_name(patch.name.clone());
            }
            if patch.avatar.is_some() {
                c.avatar = patch.avatar.clone();
            }
            Ok(())
        })
        .await
    }

    /// Soft-delete a group. Admin only; the record is archived, not removed.
    pub async fn delete(&self, id: ConversationId, actor: &UserId) -> Result<(), CoreError> {
        self.modify(id, "delete_conversation", |c| {
            require_admin(c, actor)?;
            c.archived_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        info!(conversation = %id, admin = %actor, "Group deleted");
        Ok(())
    }

    /// Point the conversation at a newer message.
    pub(crate) async fn set_last_message(
        &self,
        id: ConversationId,
        last: LastMessage,
    ) -> Result<Conversation, CoreError> {
        self.modify(id, "set_last_message", |c| {
            if c.last_message.as_ref().map_or(true, |m| m.at <= last.at) {
                c.last_message = Some(last.clone());
            }
            Ok(())
        })
        .await
    }

    /// Blank the preview if `message` is the conversation's last message.
    pub(crate) async fn scrub_last_message(
        &self,
        id: ConversationId,
        message: MessageId,
    ) -> Result<(), CoreError> {
        let current = self.find(id).await?;
        if current.last_message.as_ref().map(|m| m.id) != Some(message) {
            return Ok(());
        }
        self.modify(id, "scrub_last_message", |c| {
            if let Some(last) = c.last_message.as_mut().filter(|m| m.id == message) {
                last.preview.clear();
            }
            Ok(())
        })
        .await?;
        Ok(())
    }
}

fn require_admin(c: &Conversation, actor: &UserId) -> Result<(), CoreError> {
    if !c.is_group {
        return Err(CoreError::InvalidTarget("not a group conversation".into()));
    }
    if !c.is_member(actor) {
        return Err(CoreError::NotAMember(c.id));
    }
    if c.admin.as_ref() != Some(actor) {
        return Err(CoreError::NotAdmin);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    fn setup() -> (Arc<ConversationStore>, Arc<MemoryStore>, InMemoryDirectory) {
        let repo = Arc::new(MemoryStore::new());
        let dir = InMemoryDirectory::new();
        let store = ConversationStore::new(
            repo.clone(),
            Arc::new(dir.clone()),
            Arc::new(dir.clone()),
            RetryPolicy::default(),
        );
        (Arc::new(store), repo, dir)
    }

    fn users(names: &[&str]) -> Vec<UserId> {
        names.iter().map(|n| UserId::from(*n)).collect()
    }

    #[test]
    fn test_direct_key_is_order_independent_and_unambiguous() {
        let a = UserId::from("alice");
        let b = UserId::from("bob");
        assert_eq!(direct_key(&a, &b), direct_key(&b, &a));
        assert_ne!(
            direct_key(&"a:b".into(), &"c".into()),
            direct_key(&"a".into(), &"b:c".into())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_direct_yields_one_conversation() {
        let (store, repo, _) = setup();
        let mut handles = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let (a, b) = if i % 2 == 0 {
                    ("alice", "bob")
                } else {
                    ("bob", "alice")
                };
                store
                    .resolve_direct(&a.into(), &b.into())
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(repo.conversation_count(), 1);
    }

    #[tokio::test]
    async fn test_blocked_user_cannot_open_conversation() {
        let (store, repo, dir) = setup();
        dir.block(&"alice".into(), &"bob".into());

        let err = store
            .resolve_direct(&"bob".into(), &"alice".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Policy(_)));
        assert_eq!(repo.conversation_count(), 0);

        // The blocker cannot message the blocked user either.
        assert!(matches!(
            store.resolve_direct(&"alice".into(), &"bob".into()).await,
            Err(CoreError::Policy(_))
        ));
    }

    #[tokio::test]
    async fn test_messaging_policy() {
        let (store, _, dir) = setup();
        dir.set_messaging_policy(&"celeb".into(), MessagingPolicy::FollowersOnly);
        dir.follow(&"fan".into(), &"celeb".into());

        assert!(store.resolve_direct(&"fan".into(), &"celeb".into()).await.is_ok());
        assert!(matches!(
            store.resolve_direct(&"stranger".into(), &"celeb".into()).await,
            Err(CoreError::Policy(_))
        ));

        dir.set_messaging_policy(&"hermit".into(), MessagingPolicy::Nobody);
        assert!(matches!(
            store.resolve_direct(&"fan".into(), &"hermit".into()).await,
            Err(CoreError::Policy(_))
        ));
        assert!(matches!(
            store.resolve_direct(&"fan".into(), &"fan".into()).await,
            Err(CoreError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_find_for_user_gate() {
        let (store, _, _) = setup();
        let conv = store
            .resolve_direct(&"alice".into(), &"bob".into())
            .await
            .unwrap();

        assert!(store.find_for_user(conv.id, &"bob".into()).await.is_ok());
        assert_eq!(
            store.find_for_user(conv.id, &"eve".into()).await,
            Err(CoreError::NotAMember(conv.id))
        );
        assert!(matches!(
            store.find_for_user(uuid::Uuid::new_v4(), &"bob".into()).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_group_membership_and_admin_handover() {
        let (store, _, _) = setup();
        let alice = UserId::from("alice");
        let group = store
            .create_group(&alice, users(&["bob", "carol"]), Some("  Trip  ".into()), None)
            .await
            .unwrap();
        assert_eq!(group.admin, Some(alice.clone()));
        assert_eq!(group.name.as_deref(), Some("Trip"));
        assert_eq!(group.members.len(), 3);

        assert_eq!(
            store
                .add_members(group.id, &"bob".into(), &users(&["dave"]))
                .await,
            Err(CoreError::NotAdmin)
        );
        let group = store
            .add_members(group.id, &alice, &users(&["dave"]))
            .await
            .unwrap();
        assert!(group.is_member(&"dave".into()));

        let group = store
            .remove_member(group.id, &alice, &"dave".into())
            .await
            .unwrap();
        assert!(!group.is_member(&"dave".into()));

        let group = store.leave(group.id, &alice).await.unwrap();
        let new_admin = group.admin.clone().unwrap();
        assert!(group.is_member(&new_admin));
        assert_ne!(new_admin, alice);
    }

    #[tokio::test]
    async fn test_last_member_out_archives_group() {
        let (store, _, _) = setup();
        let group = store
            .create_group(&"alice".into(), users(&["bob"]), None, None)
            .await
            .unwrap();

        store.leave(group.id, &"alice".into()).await.unwrap();
        let last = store.leave(group.id, &"bob".into()).await.unwrap();
        assert!(last.is_archived());
        assert!(last.admin.is_none());

        assert!(matches!(
            store.find_for_user(group.id, &"bob".into()).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_delete_and_listing() {
        let (store, _, _) = setup();
        let alice = UserId::from("alice");
        let group = store
            .create_group(&alice, users(&["bob"]), Some("old".into()), None)
            .await
            .unwrap();
        store
            .resolve_direct(&alice, &"carol".into())
            .await
            .unwrap();

        let patch = ConversationPatch {
            name: Some("new".into()),
            avatar: Some("cdn://a.png".into()),
        };
        let group = store.update(group.id, &alice, patch).await.unwrap();
        assert_eq!(group.name.as_deref(), Some("new"));

        assert_eq!(
            store.delete(group.id, &"bob".into()).await,
            Err(CoreError::NotAdmin)
        );
        assert_eq!(store.list_for_user(&alice, Page::default()).await.unwrap().len(), 2);

        store.delete(group.id, &alice).await.unwrap();
        assert_eq!(store.list_for_user(&alice, Page::default()).await.unwrap().len(), 1);
    }

    fn last_message(sender: &str, minutes_ago: i64) -> LastMessage {
        LastMessage {
            id: uuid::Uuid::new_v4(),
            sender: sender.into(),
            preview: "hi".into(),
            at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    async fn tick() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_cursor_paging_follows_membership_changes() {
        let (store, _, _) = setup();
        let alice = UserId::from("alice");
        let x = store
            .create_group(&alice, users(&["bob"]), None, None)
            .await
            .unwrap();
        store.set_last_message(x.id, last_message("bob", 60)).await.unwrap();
        tick().await;
        let y = store.resolve_direct(&alice, &"dave".into()).await.unwrap();
        store.set_last_message(y.id, last_message("dave", 10)).await.unwrap();
        tick().await;
        // Old message, fresh membership change: x is now the most active.
        store.add_members(x.id, &alice, &users(&["carol"])).await.unwrap();

        let first = store.list_for_user(&alice, Page::latest(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, x.id);

        let next = Page::Cursor {
            before: Some(first[0].last_activity()),
            limit: 1,
        };
        let second = store.list_for_user(&alice, next).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, y.id);
    }

    #[tokio::test]
    async fn test_direct_conversations_cannot_be_left() {
        let (store, _, _) = setup();
        let conv = store
            .resolve_direct(&"alice".into(), &"bob".into())
            .await
            .unwrap();
        assert!(matches!(
            store.leave(conv.id, &"alice".into()).await,
            Err(CoreError::InvalidTarget(_))
        ));
    }
}
