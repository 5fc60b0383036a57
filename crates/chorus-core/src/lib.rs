//! # chorus-core
//!
//! Messaging core of the Chorus social platform.
//!
//! - **Presence** - which users hold live connections, on how many devices
//! - **Transport** - rooms and best-effort event push over live connections
//! - **Conversations** - direct and group conversation identity and membership
//! - **Delivery** - message send, read receipts, reactions, deletion
//! - **Notifications** - single, grouped and follower fan-out notifications
//! - **Hub** - wires the above over a set of repositories
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  Connection │────▶│ RealtimeTransport│◀────│ MessageDelivery  │
//! └─────────────┘     └─────────────────┘     │     Engine       │
//!                            │    ▲           └──────────────────┘
//!                            ▼    │                    │
//!                     ┌──────────────┐        ┌──────────────────┐
//!                     │   Presence   │        │ ConversationStore│
//!                     └──────────────┘        └──────────────────┘
//!                                 │
//!                     ┌──────────────────┐     ┌──────────────────┐
//!                     │  Notification    │────▶│ UserSettings /   │
//!                     │     Engine       │     │ SocialGraph      │
//!                     └──────────────────┘     └──────────────────┘
//! ```
//!
//! Every persisted write goes through a repository trait. Read-modify-write
//! paths use a version check and [`retry_on_conflict`].

pub mod conversation;
pub mod delivery;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod ids;
pub mod model;
pub mod notification;
pub mod presence;
pub mod retry;
pub mod room;
pub mod store;
pub mod transport;

pub use conversation::{ConversationPatch, ConversationStore};
pub use delivery::{DeleteScope, DeliveryConfig, MessageDeliveryEngine, MessageDraft, ReadReceipt};
pub use directory::{InMemoryDirectory, MessagingPolicy, SocialGraph, UserPreferences, UserSettings};
pub use envelope::Envelope;
pub use error::{CoreError, ErrorKind};
pub use hub::{Hub, HubConfig, Repositories};
pub use ids::{ConnectionId, ConversationId, MessageId, NotificationId, UserId};
pub use model::{Conversation, Message, MessageStatus, Notification, NotificationType, RelatedEntity};
pub use notification::{
    FanOutReport, NotificationConfig, NotificationEngine, NotificationRequest, SingleOutcome,
    SkipReason,
};
pub use presence::{Departure, PresenceChange, PresenceRegistry};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use room::conversation_room;
pub use store::{MemoryStore, Page};
pub use transport::{EventSink, RealtimeTransport, TransportConfig, TransportError, TransportStats};
