use std::error::Error;
use std::fmt;

use crate::core::envelope::{RoomId, UserId};

#[derive(Debug)]
pub enum SignalError {
    // Envelope errors
    MessageParseError(String),
    MessageEncodeError(String),
    UnknownMessageType(String),
    MissingRoomId,

    // Session state errors
    NotInRoom(UserId),
    RoomMismatch { requested: RoomId, current: RoomId },
    SessionNotFound(UserId),
    DuplicateSession(UserId),

    // Connection errors
    BackpressureExceeded(UserId),
    ConnectionClosed,
    TransportError(String),
    IdleTimeout,

    // Identity errors
    AuthError(String),

    // System errors
    ShutdownTimeout(usize),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::MessageEncodeError(msg) => write!(f, "Message encode error: {}", msg),
            Self::UnknownMessageType(kind) => write!(f, "Unknown message type: {}", kind),
            Self::MissingRoomId => write!(f, "Message does not name a room"),
            Self::NotInRoom(user_id) => write!(f, "User {} is not in any room", user_id),
            Self::RoomMismatch { requested, current } => write!(
                f,
                "Message addressed to room {} but sender is in room {}",
                requested, current
            ),
            Self::SessionNotFound(user_id) => write!(f, "Session not found: {}", user_id),
            Self::DuplicateSession(user_id) => {
                write!(f, "User {} already has an active session", user_id)
            }
            Self::BackpressureExceeded(user_id) => {
                write!(f, "Outbound queue full for user {}", user_id)
            }
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Self::IdleTimeout => write!(f, "Connection idle for too long"),
            Self::AuthError(msg) => write!(f, "Authentication error: {}", msg),
            Self::ShutdownTimeout(remaining) => write!(
                f,
                "Shutdown grace period expired with {} task(s) still running",
                remaining
            ),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for SignalError {}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::MessageParseError(err.to_string())
    }
}

impl From<warp::Error> for SignalError {
    fn from(err: warp::Error) -> Self {
        SignalError::TransportError(err.to_string())
    }
}

impl SignalError {
    /// Errors that end the session they occurred on
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BackpressureExceeded(_)
                | Self::ConnectionClosed
                | Self::TransportError(_)
                | Self::IdleTimeout
        )
    }
}

// Generic result type for rusty-signal
pub type Result<T> = std::result::Result<T, SignalError>;
