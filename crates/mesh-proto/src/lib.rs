//! Wire vocabulary shared by the mesh relay and its participants.
//! The relay only ever looks at the envelope; negotiation payloads are
//! carried as raw JSON so the server never couples to the SDP/ICE schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Participant name used as the mesh routing key.
pub type Identity = String;

pub const MAX_IDENTITY_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("malformed negotiation payload: {0}")]
    MalformedPayload(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Check that an identity is usable as a routing key.
pub fn validate_identity(identity: &str) -> Result<(), ProtoError> {
    if identity.trim().is_empty() {
        return Err(ProtoError::InvalidIdentity("identity is empty".into()));
    }
    if identity.chars().count() > MAX_IDENTITY_LEN {
        return Err(ProtoError::InvalidIdentity(format!(
            "identity longer than {MAX_IDENTITY_LEN} characters"
        )));
    }
    if identity.chars().any(char::is_control) {
        return Err(ProtoError::InvalidIdentity(
            "identity contains control characters".into(),
        ));
    }
    Ok(())
}

/// Messages sent from a participant to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request admission under `identity`
    Register { identity: Identity },
    /// Local media and state are initialized; pair me with the mesh
    Ready,
    /// Forward an opaque negotiation payload to `recipient`
    Negotiate { recipient: Identity, payload: Value },
    /// Heartbeat to keep the registration alive
    Ping,
}

/// Messages sent from the relay to a participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RegisterAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RegisterError>,
    },
    /// A mesh peer now exists; `is_offerer` is the receiver's role for the pair
    PeerJoin { identity: Identity, is_offerer: bool },
    PeerLeave { identity: Identity },
    Negotiate { sender: Identity, payload: Value },
    Pong,
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<Identity>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegisterError {
    AlreadyRegistered,
    InvalidIdentity,
    HandleAlreadyBound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownRecipient,
    NotRegistered,
    BadMessage,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Body of a `negotiate` message. On the wire this is an object holding
/// exactly one of `description` or `candidate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl NegotiationPayload {
    pub fn to_value(&self) -> Result<Value, ProtoError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtoError::MalformedPayload("payload is not an object".into()))?;
        let has_description = object.contains_key("description");
        let has_candidate = object.contains_key("candidate");
        if has_description == has_candidate {
            return Err(ProtoError::MalformedPayload(
                "expected exactly one of `description` or `candidate`".into(),
            ));
        }
        serde_json::from_value(value.clone())
            .map_err(|err| ProtoError::MalformedPayload(err.to_string()))
    }

    /// Build the outbound `negotiate` message for `recipient`.
    pub fn into_message(self, recipient: &str) -> Result<ClientMessage, ProtoError> {
        Ok(ClientMessage::Negotiate {
            recipient: recipient.to_string(),
            payload: self.to_value()?,
        })
    }
}
