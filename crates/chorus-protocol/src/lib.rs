//! # chorus-protocol
//!
//! Wire protocol for the Chorus realtime layer.
//!
//! Clients and the server exchange MessagePack-encoded [`Frame`]s with a
//! 4-byte big-endian length prefix.
//!
//! ## Frame Types
//!
//! - `Join` / `Leave` - Conversation room membership
//! - `Send` / `MarkRead` / `React` / `Typing` - Messaging actions
//! - `Event` - Server push (`new_message`, `conversation_read`, ...)
//! - `Ack` / `Error` - Request outcomes
//!
//! ## Example
//!
//! ```rust
//! use chorus_protocol::{codec, EventName, Frame};
//!
//! let frame = Frame::event(EventName::NewMessage, serde_json::json!({"content": "hi"}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use events::EventName;
pub use frames::{Frame, FrameType};

/// Current protocol version, negotiated in the `connect` frame.
pub const PROTOCOL_VERSION: u8 = 1;
