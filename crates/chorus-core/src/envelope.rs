//! Realtime event envelopes.
//!
//! One envelope is built per publish and shared by every receiving
//! connection.

use chorus_protocol::EventName;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique envelope identifier.
pub type EnvelopeId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique envelope ID.
#[must_use]
pub fn generate_envelope_id() -> EnvelopeId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    timestamp.wrapping_add(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// A server event ready for fan-out.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: EnvelopeId,
    /// Room the event was published to, if it was a room publish.
    pub room: Option<String>,
    pub event: EventName,
    /// Payload (shared for zero-copy fan-out).
    pub payload: Arc<serde_json::Value>,
    pub timestamp: u64,
}

impl Envelope {
    #[must_use]
    pub fn new(event: EventName, payload: serde_json::Value) -> Self {
        Self {
            id: generate_envelope_id(),
            room: None,
            event,
            payload: Arc::new(payload),
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn in_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let env = Envelope::new(EventName::Typing, json!({"user": "alice"})).in_room("conversation:1");
        assert_eq!(env.event, EventName::Typing);
        assert_eq!(env.room.as_deref(), Some("conversation:1"));
        assert_eq!(env.payload["user"], "alice");
    }

    #[test]
    fn test_unique_envelope_ids() {
        assert_ne!(generate_envelope_id(), generate_envelope_id());
    }
}
