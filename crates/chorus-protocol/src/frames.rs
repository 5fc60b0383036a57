//! Frame types for the Chorus protocol.
//!
//! Frames are the unit of communication on a realtime connection.
//! Each frame is serialized using MessagePack.

use crate::events::EventName;
use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Join = 0x03,
    Leave = 0x04,
    Send = 0x05,
    MarkRead = 0x06,
    React = 0x07,
    Typing = 0x08,
    Event = 0x09,
    Ack = 0x0A,
    Error = 0x0B,
    Ping = 0x0C,
    Pong = 0x0D,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Join),
            0x04 => Ok(FrameType::Leave),
            0x05 => Ok(FrameType::Send),
            0x06 => Ok(FrameType::MarkRead),
            0x07 => Ok(FrameType::React),
            0x08 => Ok(FrameType::Typing),
            0x09 => Ok(FrameType::Event),
            0x0A => Ok(FrameType::Ack),
            0x0B => Ok(FrameType::Error),
            0x0C => Ok(FrameType::Ping),
            0x0D => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
///
/// Client frames carry a request `id` that the server echoes in the
/// matching `Ack` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client handshake.
    Connect {
        /// Protocol version spoken by the client.
        version: u8,
    },

    /// Handshake response.
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Join a conversation room.
    Join {
        id: u64,
        conversation_id: String,
    },

    /// Leave a conversation room.
    Leave {
        id: u64,
        conversation_id: String,
    },

    /// Send a message, either into a conversation or directly to a user.
    Send {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    /// Mark every unseen message in a conversation as read.
    MarkRead {
        id: u64,
        conversation_id: String,
    },

    /// Set (`Some`) or clear (`None`) the caller's reaction on a message.
    React {
        id: u64,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emoji: Option<String>,
    },

    /// Typing indicator. Fire-and-forget, never acknowledged.
    Typing {
        conversation_id: String,
        active: bool,
    },

    /// Server push.
    Event {
        event: EventName,
        payload: serde_json::Value,
    },

    /// Successful outcome of a request.
    Ack {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// Failed outcome of a request (`id` is 0 when not tied to one).
    Error {
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Send { .. } => FrameType::Send,
            Frame::MarkRead { .. } => FrameType::MarkRead,
            Frame::React { .. } => FrameType::React,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a Join frame.
    #[must_use]
    pub fn join(id: u64, conversation_id: impl Into<String>) -> Self {
        Frame::Join {
            id,
            conversation_id: conversation_id.into(),
        }
    }

    /// Create a Send frame targeting an existing conversation.
    #[must_use]
    pub fn send_to_conversation(
        id: u64,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Frame::Send {
            id,
            conversation_id: Some(conversation_id.into()),
            recipient: None,
            content: content.into(),
            media: Vec::new(),
            reply_to: None,
        }
    }

    /// Create a Send frame addressed to a user, opening a direct conversation if needed.
    #[must_use]
    pub fn send_to_user(id: u64, recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::Send {
            id,
            conversation_id: None,
            recipient: Some(recipient.into()),
            content: content.into(),
            media: Vec::new(),
            reply_to: None,
        }
    }

    /// Create an Event frame.
    #[must_use]
    pub fn event(event: EventName, payload: serde_json::Value) -> Self {
        Frame::Event { event, payload }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id, data: None }
    }

    /// Create an Ack frame carrying a result.
    #[must_use]
    pub fn ack_with(id: u64, data: serde_json::Value) -> Self {
        Frame::Ack {
            id,
            data: Some(data),
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// The request id carried by a client frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Join { id, .. }
            | Frame::Leave { id, .. }
            | Frame::Send { id, .. }
            | Frame::MarkRead { id, .. }
            | Frame::React { id, .. } => Some(*id),
            _ => None,
        }
    }
}
