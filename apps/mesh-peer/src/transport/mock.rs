//! Scripted in-memory transport.
//!
//! Records every call the session makes and lets the caller inject
//! transport events by hand, so negotiation can be driven step by step
//! without sockets. Media handles are plain strings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mesh_proto::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{MediaAttach, PeerTransport, TransportEvent, TransportFactory};
use crate::error::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetRemote(SdpType),
    AddCandidate(String),
    AttachMedia(String),
    Rollback,
    Close,
}

#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    remote_set: AtomicBool,
    has_media: AtomicBool,
    descriptions: AtomicUsize,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn next_sdp(&self, prefix: &str) -> String {
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", prefix, n)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    type LocalMedia = String;
    type RemoteMedia = String;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.record(Call::CreateOffer { ice_restart });
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        if description.kind == SdpType::Rollback {
            return Err(PeerError::InvalidNegotiationState("rollback".into()));
        }
        self.record(Call::SetRemote(description.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        // Real stacks reject candidates before a remote description too.
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(PeerError::InvalidNegotiationState(
                "candidate before remote description".into(),
            ));
        }
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn rollback_local_offer(&self) -> Result<(), PeerError> {
        self.record(Call::Rollback);
        Ok(())
    }

    async fn attach_media(&self, media: String) -> Result<MediaAttach, PeerError> {
        self.record(Call::AttachMedia(media));
        if self.has_media.swap(true, Ordering::SeqCst) {
            Ok(MediaAttach::Replaced)
        } else {
            Ok(MediaAttach::Added)
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(Call::Close);
        Ok(())
    }
}

type Events = mpsc::UnboundedSender<TransportEvent<String>>;

/// Hands out [`MockTransport`]s and keeps each one reachable by remote identity.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<HashMap<String, (Arc<MockTransport>, Events)>>,
    total: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent transport created for `remote`.
    pub fn transport(&self, remote: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .get(remote)
            .map(|(transport, _)| Arc::clone(transport))
    }

    /// Inject an event as if the transport for `remote` had raised it.
    pub fn emit(&self, remote: &str, event: TransportEvent<String>) -> bool {
        self.created
            .lock()
            .get(remote)
            .map(|(_, tx)| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn created(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    async fn create(&self, remote: &str, events: Events) -> Result<Arc<MockTransport>, PeerError> {
        let transport = Arc::new(MockTransport::default());
        self.created
            .lock()
            .insert(remote.to_string(), (Arc::clone(&transport), events));
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }
}
