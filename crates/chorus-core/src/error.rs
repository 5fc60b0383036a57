//! Domain errors.

use crate::ids::ConversationId;
use thiserror::Error;

/// Error taxonomy surfaced to the API and realtime layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller is not a member, not the sender, or not the admin.
    Authorization,
    /// Empty content, invalid target, over-long input.
    Validation,
    /// Conversation, message or notification absent.
    NotFound,
    /// Concurrent write lost the race and retries were exhausted.
    Conflict,
    /// Blocked, muted, or messaging not permitted.
    Policy,
    /// Delete-for-everyone requested after the allowed window.
    TimeWindowExpired,
    /// A multi-record operation failed part way and was rolled back.
    Unavailable,
}

impl ErrorKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authorization => "authorization",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Policy => "policy",
            ErrorKind::TimeWindowExpired => "time_window_expired",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// Errors produced by the messaging core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Not a member of conversation {0}")]
    NotAMember(ConversationId),

    #[error("Only the sender may do this")]
    NotSender,

    #[error("Only the group admin may do this")]
    NotAdmin,

    #[error("Message has no content or media")]
    EmptyMessage,

    #[error("Message longer than {0} characters")]
    ContentTooLong(usize),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Write conflict on {0}")]
    Conflict(String),

    #[error("Cannot message this user: {0}")]
    Policy(String),

    #[error("Too late to delete")]
    TooLateToDelete,

    #[error("Temporarily unavailable, retry: {0}")]
    Unavailable(String),
}

impl CoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Map onto the error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotAMember(_) | CoreError::NotSender | CoreError::NotAdmin => {
                ErrorKind::Authorization
            }
            CoreError::EmptyMessage | CoreError::ContentTooLong(_) | CoreError::InvalidTarget(_) => {
                ErrorKind::Validation
            }
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Policy(_) => ErrorKind::Policy,
            CoreError::TooLateToDelete => ErrorKind::TimeWindowExpired,
            CoreError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Whether this is a write-conflict class failure.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict(_))
    }

    /// Whether the caller may retry the whole operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Conflict(_) | CoreError::Unavailable(_))
    }

    /// Stable numeric code carried in protocol error frames.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Authorization => 4003,
            ErrorKind::Validation => 4000,
            ErrorKind::NotFound => 4004,
            ErrorKind::Conflict => 4009,
            ErrorKind::Policy => 4030,
            ErrorKind::TimeWindowExpired => 4010,
            ErrorKind::Unavailable => 5030,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert_eq!(CoreError::NotSender.kind(), ErrorKind::Authorization);
        assert_eq!(CoreError::EmptyMessage.kind(), ErrorKind::Validation);
        assert_eq!(
            CoreError::TooLateToDelete.kind(),
            ErrorKind::TimeWindowExpired
        );
        assert_eq!(CoreError::not_found("message", "m1").code(), 4004);
    }

    #[test]
    fn test_retry_classes() {
        assert!(CoreError::Conflict("m1".into()).is_conflict());
        assert!(CoreError::Unavailable("x".into()).is_retryable());
        assert!(!CoreError::Unavailable("x".into()).is_conflict());
        assert!(!CoreError::Policy("blocked".into()).is_retryable());
    }
}
