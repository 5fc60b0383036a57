//! Server to client event names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Names of events pushed from the server to connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    /// A message was posted to a conversation the client belongs to.
    NewMessage,
    /// The delivery status of one of the client's messages changed.
    MessageStatus,
    /// Another member read messages in a conversation.
    ConversationRead,
    /// A reaction was added to or removed from a message.
    MessageReaction,
    /// A message was deleted for everyone.
    MessageDeleted,
    /// A notification was created for the client.
    NewNotification,
    /// A user sharing a conversation came online or went offline.
    UserStatusChange,
    /// A member started typing.
    Typing,
    /// A member stopped typing.
    StopTyping,
}

impl EventName {
    /// The wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::NewMessage => "new_message",
            EventName::MessageStatus => "message_status",
            EventName::ConversationRead => "conversation_read",
            EventName::MessageReaction => "message_reaction",
            EventName::MessageDeleted => "message_deleted",
            EventName::NewNotification => "new_notification",
            EventName::UserStatusChange => "user_status_change",
            EventName::Typing => "typing",
            EventName::StopTyping => "stop_typing",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
