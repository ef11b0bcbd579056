//! Per-connection error taxonomy.
//!
//! Every variant is contained within the connection that produced it; none of
//! them may take down the registry, another connection, or the process.

use std::time::Duration;

/// Errors raised while handling a single connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    // Join-time, recoverable by the client
    /// The display name is already taken in the target room.
    #[error("username '{username}' already exists in room '{room}'")]
    DuplicateName { room: String, username: String },
    /// The room does not exist and the join did not allow creating it.
    #[error("room '{0}' does not exist")]
    RoomNotFound(String),
    /// The first frame was not a usable join request.
    #[error("invalid join request: {0}")]
    InvalidJoin(String),

    // Per-message, non-fatal
    /// An inbound frame could not be parsed; it is skipped.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    // Per-recipient, isolated
    /// A frame could not be queued for a recipient.
    #[error("delivery to {recipient} failed: {cause}")]
    DeliveryFailure { recipient: String, cause: String },

    // Fatal to the session
    /// No inbound activity within the liveness window.
    #[error("no activity for {0:?}")]
    LivenessTimeout(Duration),
    /// The join request did not arrive in time.
    #[error("join request not received within {0:?}")]
    HandshakeTimeout(Duration),
}

impl RelayError {
    /// Whether this error rejects a join (and is reported to the client).
    pub fn is_join_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. } | Self::RoomNotFound(_) | Self::InvalidJoin(_)
        )
    }

    /// Text placed in the `error` envelope sent to the client, if any.
    pub fn client_message(&self) -> Option<&'static str> {
        match self {
            Self::DuplicateName { .. } => Some("Username already exists in this room"),
            Self::RoomNotFound(_) => Some("Room doesn't exist"),
            Self::InvalidJoin(_) => Some("Invalid join request"),
            _ => None,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateName { .. } => "duplicate_name",
            Self::RoomNotFound(_) => "room_not_found",
            Self::InvalidJoin(_) => "invalid_join",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::DeliveryFailure { .. } => "delivery_failure",
            Self::LivenessTimeout(_) => "liveness_timeout",
            Self::HandshakeTimeout(_) => "handshake_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_errors_classified() {
        assert!(
            RelayError::DuplicateName {
                room: "lobby".into(),
                username: "alice".into()
            }
            .is_join_error()
        );
        assert!(RelayError::RoomNotFound("lobby".into()).is_join_error());
        assert!(RelayError::InvalidJoin("empty room".into()).is_join_error());
        assert!(!RelayError::MalformedFrame("eof".into()).is_join_error());
        assert!(!RelayError::HandshakeTimeout(Duration::from_secs(10)).is_join_error());
    }

    #[test]
    fn only_join_errors_reach_the_client() {
        assert_eq!(
            RelayError::RoomNotFound("x".into()).client_message(),
            Some("Room doesn't exist")
        );
        assert!(RelayError::LivenessTimeout(Duration::from_secs(30)).client_message().is_none());
        assert!(
            RelayError::DeliveryFailure {
                recipient: "bob".into(),
                cause: "queue full".into()
            }
            .client_message()
            .is_none()
        );
    }

    #[test]
    fn display_includes_context() {
        let err = RelayError::DuplicateName {
            room: "lobby".into(),
            username: "alice".into(),
        };
        let text = err.to_string();
        assert!(text.contains("alice"));
        assert!(text.contains("lobby"));
    }

    #[test]
    fn kinds_are_snake_case() {
        let all = [
            RelayError::DuplicateName {
                room: String::new(),
                username: String::new(),
            },
            RelayError::RoomNotFound(String::new()),
            RelayError::InvalidJoin(String::new()),
            RelayError::MalformedFrame(String::new()),
            RelayError::DeliveryFailure {
                recipient: String::new(),
                cause: String::new(),
            },
            RelayError::LivenessTimeout(Duration::ZERO),
            RelayError::HandshakeTimeout(Duration::ZERO),
        ];
        for err in all {
            let kind = err.kind();
            assert!(
                kind.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "kind '{kind}' must be snake_case"
            );
        }
    }
}
