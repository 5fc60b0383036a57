//! Notifications: single, grouped, and follower fan-out.
//!
//! Single notifications respect the recipient's blocks, mutes and per-type
//! toggles, merge into an unread record sharing their group key within the
//! rolling window, and are pushed live when a new record is created.
//! Follower fan-out streams the follower cursor in fixed-size batches and
//! writes each batch as one bulk insert without live push.

use crate::directory::{SocialGraph, UserSettings};
use crate::error::CoreError;
use crate::ids::{NotificationId, UserId};
use crate::model::{Notification, NotificationType, RelatedEntity};
use crate::store::{GroupedUpsert, NotificationRepository, Page};
use crate::transport::RealtimeTransport;
use chorus_protocol::EventName;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Placeholder replaced with the acting user's id in fan-out templates.
pub const ACTOR_PLACEHOLDER: &str = "{actor}";

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Rolling window within which same-key notifications merge.
    #[serde(default = "default_group_window")]
    pub group_window_secs: u64,
    /// Followers per fan-out batch.
    #[serde(default = "default_batch_size")]
    pub fanout_batch_size: usize,
}

fn default_group_window() -> u64 {
    24 * 60 * 60
}

fn default_batch_size() -> usize {
    500
}

impl NotificationConfig {
    /// Grouping window. Out-of-range settings saturate instead of overflowing.
    #[must_use]
    pub fn group_window(&self) -> Duration {
        i64::try_from(self.group_window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            group_window_secs: default_group_window(),
            fanout_batch_size: default_batch_size(),
        }
    }
}

/// A request for one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub recipient: UserId,
    pub sender: UserId,
    pub kind: NotificationType,
    pub content: String,
    pub group_key: Option<String>,
    pub related: Option<RelatedEntity>,
}

impl NotificationRequest {
    #[must_use]
    pub fn new(
        recipient: impl Into<UserId>,
        sender: impl Into<UserId>,
        kind: NotificationType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            sender: sender.into(),
            kind,
            content: content.into(),
            group_key: None,
            related: None,
        }
    }

    #[must_use]
    pub fn grouped(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn about(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.related = Some(RelatedEntity {
            kind: kind.into(),
            id: id.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SelfNotification,
    /// Recipient blocked or muted the sender.
    Silenced,
    /// Recipient turned this notification type off.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleOutcome {
    Skipped(SkipReason),
    Created(Notification),
    Merged(Notification),
}

impl SingleOutcome {
    #[must_use]
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            SingleOutcome::Created(n) | SingleOutcome::Merged(n) => Some(n),
            SingleOutcome::Skipped(_) => None,
        }
    }
}

/// What a follower fan-out did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Size of every batch pulled from the follower cursor, in order.
    pub batch_sizes: Vec<usize>,
    pub created: usize,
    pub filtered: usize,
    pub failed_batches: usize,
}

impl FanOutReport {
    #[must_use]
    pub fn followers_seen(&self) -> usize {
        self.batch_sizes.iter().sum()
    }

    #[must_use]
    pub fn largest_batch(&self) -> usize {
        self.batch_sizes.iter().copied().max().unwrap_or(0)
    }
}

/// Substitute the actor into a content template.
#[must_use]
pub fn render_template(template: &str, actor: &UserId) -> String {
    template.replace(ACTOR_PLACEHOLDER, actor.as_str())
}

pub struct NotificationEngine {
    repo: Arc<dyn NotificationRepository>,
    settings: Arc<dyn UserSettings>,
    graph: Arc<dyn SocialGraph>,
    transport: Arc<RealtimeTransport>,
    config: NotificationConfig,
}

impl NotificationEngine {
    #[must_use]
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        settings: Arc<dyn UserSettings>,
        graph: Arc<dyn SocialGraph>,
        transport: Arc<RealtimeTransport>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            repo,
            settings,
            graph,
            transport,
            config,
        }
    }

    /// Create, merge, or skip one notification.
    pub async fn create_single(
        &self,
        request: NotificationRequest,
    ) -> Result<SingleOutcome, CoreError> {
        if request.recipient == request.sender {
            return Ok(SingleOutcome::Skipped(SkipReason::SelfNotification));
        }
        let prefs = self.settings.preferences(&request.recipient).await?;
        if prefs.silences(&request.sender) {
            return Ok(SingleOutcome::Skipped(SkipReason::Silenced));
        }
        if !prefs.wants(request.kind) {
            return Ok(SingleOutcome::Skipped(SkipReason::Disabled));
        }

        let grouped = request.group_key.is_some();
        let candidate = Notification::new(
            request.recipient,
            request.sender,
            request.kind,
            request.content,
            request.group_key,
            request.related,
        );

        let outcome = if grouped {
            let window_start = Utc::now()
                .checked_sub_signed(self.config.group_window())
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            match self.repo.upsert_grouped(candidate, window_start).await? {
                GroupedUpsert::Created(n) => SingleOutcome::Created(n),
                GroupedUpsert::Merged(n) => SingleOutcome::Merged(n),
            }
        } else {
            SingleOutcome::Created(self.repo.insert(candidate).await?)
        };

        match &outcome {
            SingleOutcome::Created(n) => {
                let reached = self.transport.publish_to_user(
                    &n.recipient,
                    EventName::NewNotification,
                    json!({ "notification": n }),
                );
                trace!(recipient = %n.recipient, notification = %n.id, reached, "Notification created");
            }
            SingleOutcome::Merged(n) => {
                trace!(recipient = %n.recipient, notification = %n.id, group_count = n.group_count, "Notification merged");
            }
            SingleOutcome::Skipped(_) => {}
        }
        Ok(outcome)
    }

    /// Notify every follower of `actor`.
    ///
    /// Followers are pulled from the cursor one batch at a time; a batch
    /// that fails is logged and skipped. Nothing is pushed live.
    pub async fn fan_out_to_followers(
        &self,
        actor: &UserId,
        kind: NotificationType,
        template: &str,
        related: Option<RelatedEntity>,
    ) -> FanOutReport {
        let content = render_template(template, actor);
        let batch_size = self.config.fanout_batch_size.max(1);
        let mut report = FanOutReport::default();

        let mut batches = self.graph.followers(actor).chunks(batch_size);
        while let Some(batch) = batches.next().await {
            report.batch_sizes.push(batch.len());
            let index = report.batch_sizes.len();

            let followers: Result<Vec<UserId>, CoreError> = batch.into_iter().collect();
            let result = match followers {
                Ok(followers) => {
                    self.notify_batch(actor, kind, &content, related.as_ref(), followers)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok((created, filtered)) => {
                    report.created += created;
                    report.filtered += filtered;
                    trace!(actor = %actor, batch = index, created, filtered, "Fan-out batch done");
                }
                Err(e) => {
                    report.failed_batches += 1;
                    warn!(actor = %actor, batch = index, error = %e, "Fan-out batch failed, skipping");
                }
            }
        }

        info!(
            actor = %actor,
            kind = ?kind,
            batches = report.batch_sizes.len(),
            created = report.created,
            filtered = report.filtered,
            failed_batches = report.failed_batches,
            "Fan-out complete"
        );
        report
    }

    async fn notify_batch(
        &self,
        actor: &UserId,
        kind: NotificationType,
        content: &str,
        related: Option<&RelatedEntity>,
        followers: Vec<UserId>,
    ) -> Result<(usize, usize), CoreError> {
        let prefs = self.settings.preferences_batch(&followers).await?;
        let total = followers.len();

        let notifications: Vec<Notification> = followers
            .into_iter()
            .filter(|follower| {
                follower != actor
                    && prefs
                        .get(follower)
                        .map_or(true, |p| !p.silences(actor) && p.wants(kind))
            })
            .map(|follower| {
                Notification::new(
                    follower,
                    actor.clone(),
                    kind,
                    content.to_string(),
                    None,
                    related.cloned(),
                )
            })
            .collect();

        let filtered = total - notifications.len();
        let created = self.repo.insert_many(notifications).await?;
        Ok((created, filtered))
    }

    /// Newest first.
    pub async fn list(
        &self,
        recipient: &UserId,
        page: Page,
    ) -> Result<Vec<Notification>, CoreError> {
        self.repo.list(recipient, page).await
    }

    pub async fn unread_count(&self, recipient: &UserId) -> Result<usize, CoreError> {
        self.repo.unread_count(recipient).await
    }

    pub async fn mark_read(&self, recipient: &UserId, id: NotificationId) -> Result<(), CoreError> {
        if self.repo.mark_read(recipient, id).await? {
            Ok(())
        } else {
            Err(CoreError::not_found("notification", id))
        }
    }

    pub async fn mark_all_read(&self, recipient: &UserId) -> Result<usize, CoreError> {
        let count = self.repo.mark_all_read(recipient).await?;
        debug!(recipient = %recipient, count, "Marked all notifications read");
        Ok(count)
    }

    pub async fn delete(&self, recipient: &UserId, id: NotificationId) -> Result<(), CoreError> {
        if self.repo.delete(recipient, id).await? {
            Ok(())
        } else {
            Err(CoreError::not_found("notification", id))
        }
    }

    /// Take back `sender`'s contribution to a grouped notification, such as
    /// an unlike. The notification goes away with its last sender.
    pub async fn retract(
        &self,
        recipient: &UserId,
        group_key: &str,
        sender: &UserId,
    ) -> Result<Option<Notification>, CoreError> {
        self.repo.retract_sender(recipient, group_key, sender).await
    }

    /// Drop expired notifications. Driven by an external sweep.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let purged = self.repo.purge_expired(now).await?;
        if purged > 0 {
            info!(purged, "Purged expired notifications");
        }
        Ok(purged)
    }
}
