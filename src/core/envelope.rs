//! Wire envelope codec
//!
//! Every frame exchanged with a client is a JSON envelope carrying a `type`,
//! routing fields, and a payload the relay never interprets.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::auth::identity::Identity;
use crate::error::{Result, SignalError};

/// Identity of a connected principal, assigned by the identity collaborator
pub type UserId = u64;

/// Identity of an ephemeral room, allocated outside the relay
pub type RoomId = u64;

/// Envelope kinds understood by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    JoinRoom,
    LeaveRoom,
    SdpOffer,
    SdpAnswer,
    IceCandidate,
    UserJoined,
    UserLeft,
    /// Anything else; kept so it can be logged before being dropped
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::JoinRoom => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::SdpOffer => "sdp_offer",
            Self::SdpAnswer => "sdp_answer",
            Self::IceCandidate => "ice_candidate",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::Other(kind) => kind.as_str(),
        }
    }

    /// Offer, answer and candidate messages relayed between room members
    pub fn is_signaling(&self) -> bool {
        matches!(self, Self::SdpOffer | Self::SdpAnswer | Self::IceCandidate)
    }
}

impl From<String> for MessageKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "join_room" => Self::JoinRoom,
            "leave_room" => Self::LeaveRoom,
            "sdp_offer" => Self::SdpOffer,
            "sdp_answer" => Self::SdpAnswer,
            "ice_candidate" => Self::IceCandidate,
            "user_joined" => Self::UserJoined,
            "user_left" => Self::UserLeft,
            _ => Self::Other(kind),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

/// A single wire message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Always overwritten with the sending session's identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    /// Reserved for point-to-point delivery, not used for routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<UserId>,
}

#[derive(Deserialize)]
struct JoinPayload {
    #[serde(default)]
    room_id: Option<RoomId>,
}

#[derive(Serialize)]
struct UserJoinedPayload<'a> {
    user_id: UserId,
    user_name: Option<&'a str>,
    user_username: Option<&'a str>,
}

#[derive(Serialize)]
struct UserLeftPayload {
    user_id: UserId,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            user_id: None,
            room_id: None,
            payload: None,
            target_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Box<RawValue>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Membership notice sent to a room after a session joins it
    pub fn user_joined(room_id: RoomId, identity: &Identity) -> Result<Self> {
        let payload = to_raw(&UserJoinedPayload {
            user_id: identity.user_id,
            user_name: identity.display_name.as_deref(),
            user_username: identity.username.as_deref(),
        })?;
        Ok(Self {
            kind: MessageKind::UserJoined,
            user_id: Some(identity.user_id),
            room_id: Some(room_id),
            payload: Some(payload),
            target_id: None,
        })
    }

    /// Membership notice sent to the remaining members after a session leaves
    pub fn user_left(room_id: RoomId, user_id: UserId) -> Result<Self> {
        let payload = to_raw(&UserLeftPayload { user_id })?;
        Ok(Self {
            kind: MessageKind::UserLeft,
            user_id: Some(user_id),
            room_id: Some(room_id),
            payload: Some(payload),
            target_id: None,
        })
    }

    /// Room requested by a `join_room` message: `payload.room_id`, else the top-level field
    pub fn join_target(&self) -> Option<RoomId> {
        self.payload
            .as_ref()
            .and_then(|raw| serde_json::from_str::<JoinPayload>(raw.get()).ok())
            .and_then(|payload| payload.room_id)
            .or(self.room_id)
    }
}

fn to_raw<T: Serialize>(value: &T) -> Result<Box<RawValue>> {
    serde_json::value::to_raw_value(value)
        .map_err(|e| SignalError::MessageEncodeError(e.to_string()))
}

/// Parse one inbound frame
pub fn decode(data: &[u8]) -> Result<Envelope> {
    let mut envelope: Envelope = serde_json::from_slice(data).map_err(SignalError::from)?;
    if let Some(payload) = envelope.payload.take() {
        envelope.payload = Some(single_line(payload)?);
    }
    Ok(envelope)
}

/// Drop raw line breaks from a payload so it can never contain the batch delimiter.
///
/// Line breaks inside JSON strings are always escaped, so only insignificant
/// whitespace is removed and the value itself is unchanged.
fn single_line(raw: Box<RawValue>) -> Result<Box<RawValue>> {
    let is_break = |c: char| c == '\n' || c == '\r';
    if !raw.get().contains(is_break) {
        return Ok(raw);
    }
    let flat: String = raw.get().chars().filter(|c| !is_break(*c)).collect();
    RawValue::from_string(flat).map_err(SignalError::from)
}

/// Serialize an envelope for the outbound queue
pub fn encode(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(|e| SignalError::MessageEncodeError(e.to_string()))
}
