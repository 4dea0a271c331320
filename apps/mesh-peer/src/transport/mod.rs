//! The media connection underneath a peer session.
//!
//! A session only ever talks to its transport through [`PeerTransport`];
//! asynchronous happenings on the connection (gathered candidates, state
//! changes, arriving media) flow back as [`TransportEvent`]s on the channel
//! handed to [`TransportFactory::create`].

use std::sync::Arc;

use async_trait::async_trait;
use mesh_proto::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::PeerError;

pub mod mock;
pub mod rtc;

/// Connectivity as reported by the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent<R> {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteMedia(R),
}

/// Whether outbound media was negotiated fresh or swapped onto an existing sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAttach {
    Added,
    Replaced,
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    type LocalMedia: Clone + Send + Sync + 'static;
    type RemoteMedia: Clone + Send + Sync + 'static;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the applied remote offer and install it locally.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Withdraw an unanswered local offer so a remote one can be applied.
    async fn rollback_local_offer(&self) -> Result<(), PeerError>;

    async fn attach_media(&self, media: Self::LocalMedia) -> Result<MediaAttach, PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: PeerTransport;

    async fn create(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<
            TransportEvent<<Self::Transport as PeerTransport>::RemoteMedia>,
        >,
    ) -> Result<Arc<Self::Transport>, PeerError>;
}

pub type LocalMediaOf<F> = <<F as TransportFactory>::Transport as PeerTransport>::LocalMedia;
pub type RemoteMediaOf<F> = <<F as TransportFactory>::Transport as PeerTransport>::RemoteMedia;
