//! Wire protocol.
//!
//! The first client frame is a [`JoinRequest`]. After that, every inbound
//! frame is classified into an [`Inbound`] without parsing the negotiation
//! payload itself; relay frames are forwarded byte-for-byte. Server-originated
//! frames are [`ServerEnvelope`]s serialized as `{"type": .., "data": ..}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RelayError;

/// Fields whose presence marks a frame as negotiation traffic.
const RELAY_FIELDS: [&str; 3] = ["sdp", "ice", "candidate"];

/// First frame sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct JoinRequest {
    /// Room to join.
    pub room: String,
    /// Display name, unique within the room.
    pub username: String,
    /// Create the room if it does not exist. Absent or `null` means `false`.
    #[serde(default, deserialize_with = "null_as_false")]
    pub create: bool,
    /// Legacy clients send `"action": "join"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

impl JoinRequest {
    /// Parse and validate a join frame.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let request: Self = serde_json::from_str(raw)
            .map_err(|e| RelayError::InvalidJoin(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), RelayError> {
        if let Some(action) = self.action.as_deref() {
            if action != "join" {
                return Err(RelayError::InvalidJoin(format!("unexpected action '{action}'")));
            }
        }
        if self.room.trim().is_empty() {
            return Err(RelayError::InvalidJoin("room is empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(RelayError::InvalidJoin("username is empty".into()));
        }
        Ok(())
    }
}

/// Membership snapshot of one room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Display names of all members.
    pub users: Vec<String>,
    /// Members that currently announce an active stream.
    #[serde(rename = "streamingUsers", default)]
    pub streaming_users: Vec<String>,
}

/// Frames originated by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Full membership snapshot.
    RoomInfo(RoomInfo),
    /// Join rejection; always followed by close.
    Error(String),
    /// Reply to an application-level ping.
    Pong,
    /// A member stopped streaming.
    StreamEnded(String),
}

impl ServerEnvelope {
    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// How frames with no recognizable control word or negotiation field are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPolicy {
    /// Forward anything that is not a control frame.
    #[default]
    Permissive,
    /// Forward only frames carrying `sdp`, `ice` or `candidate`.
    Strict,
}

/// Classification of one inbound frame from an active session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Graceful departure.
    Leave,
    /// Application-level heartbeat probe.
    Ping,
    /// Application-level heartbeat reply.
    Pong,
    /// A join request after the session is already active.
    Join,
    /// The member started streaming.
    StartStream,
    /// The member stopped streaming.
    EndStream,
    /// Negotiation payload to forward verbatim.
    Relay,
    /// No control word and no negotiation field.
    Unrecognized,
}

impl Inbound {
    /// Classify a raw text frame.
    ///
    /// The control word is read from `type`, falling back to the legacy
    /// `action` field. Only JSON objects are accepted.
    pub fn classify(raw: &str) -> Result<Self, RelayError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| RelayError::MalformedFrame(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(RelayError::MalformedFrame("frame is not a JSON object".into()));
        };

        let control = map
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| map.get("action").and_then(Value::as_str));

        let kind = match control {
            Some("leave") => Self::Leave,
            Some("ping") => Self::Ping,
            Some("pong") => Self::Pong,
            Some("join") => Self::Join,
            Some("start_stream") => Self::StartStream,
            Some("end_stream") => Self::EndStream,
            _ if RELAY_FIELDS.iter().any(|f| map.get(*f).is_some_and(|v| !v.is_null())) => {
                Self::Relay
            }
            _ => Self::Unrecognized,
        };
        Ok(kind)
    }

    /// Whether a frame of this kind is forwarded to the other members.
    pub fn is_forwarded(self, policy: RelayPolicy) -> bool {
        match self {
            Self::Relay => true,
            Self::Unrecognized => policy == RelayPolicy::Permissive,
            _ => false,
        }
    }
}
