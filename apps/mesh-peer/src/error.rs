use mesh_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    /// A payload arrived that the session cannot accept in its current state.
    #[error("invalid negotiation state: {0}")]
    InvalidNegotiationState(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// Local media could not be acquired; no sessions are created.
    #[error("local media unavailable: {0}")]
    SetupFailure(String),
    #[error("webrtc error: {0}")]
    Transport(#[from] webrtc::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("session closed")]
    SessionClosed,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("identity `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
}
