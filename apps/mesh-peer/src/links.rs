//! What the mesh exposes to the rest of the application: a snapshot of every
//! link plus a stream of changes to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mesh_proto::Identity;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::session::PeerState;

#[derive(Clone)]
pub struct PeerLink<R> {
    pub state: PeerState,
    pub media: Option<R>,
    pub live: bool,
}

impl<R> fmt::Debug for PeerLink<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("state", &self.state)
            .field("media", &self.media.is_some())
            .field("live", &self.live)
            .finish()
    }
}

pub enum MeshEvent<R> {
    /// A session changed state; `media` is the inbound media for that peer, if any.
    Link {
        identity: Identity,
        state: PeerState,
        media: Option<R>,
        live: bool,
    },
    /// Local outbound media could not be acquired.
    SetupFailed { reason: String },
}

impl<R> fmt::Debug for MeshEvent<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::Link {
                identity,
                state,
                media,
                live,
            } => f
                .debug_struct("Link")
                .field("identity", identity)
                .field("state", state)
                .field("media", &media.is_some())
                .field("live", live)
                .finish(),
            MeshEvent::SetupFailed { reason } => f
                .debug_struct("SetupFailed")
                .field("reason", reason)
                .finish(),
        }
    }
}

pub struct LinkBoard<R> {
    links: Arc<RwLock<HashMap<Identity, PeerLink<R>>>>,
    events: mpsc::UnboundedSender<MeshEvent<R>>,
}

impl<R> Clone for LinkBoard<R> {
    fn clone(&self) -> Self {
        Self {
            links: Arc::clone(&self.links),
            events: self.events.clone(),
        }
    }
}

impl<R: Clone + Send + Sync + 'static> LinkBoard<R> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeshEvent<R>>) {
        let (events, rx) = mpsc::unbounded_channel();
        let board = Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            events,
        };
        (board, rx)
    }

    /// Record a state change, keeping whatever media was surfaced before.
    pub fn transition(&self, identity: &str, state: PeerState) {
        let media = {
            let mut links = self.links.write();
            if state == PeerState::Closed {
                links.remove(identity);
                None
            } else {
                let link = links.entry(identity.to_string()).or_insert(PeerLink {
                    state,
                    media: None,
                    live: false,
                });
                link.state = state;
                link.live = state.is_live();
                link.media.clone()
            }
        };
        self.publish(identity, state, media);
    }

    /// Record a state change that makes new inbound media available.
    pub fn surface(&self, identity: &str, state: PeerState, media: R) {
        self.links.write().insert(
            identity.to_string(),
            PeerLink {
                state,
                media: Some(media.clone()),
                live: state.is_live(),
            },
        );
        self.publish(identity, state, Some(media));
    }

    pub fn setup_failed(&self, reason: &str) {
        let _ = self.events.send(MeshEvent::SetupFailed {
            reason: reason.to_string(),
        });
    }

    pub fn get(&self, identity: &str) -> Option<PeerLink<R>> {
        self.links.read().get(identity).cloned()
    }

    pub fn snapshot(&self) -> HashMap<Identity, PeerLink<R>> {
        self.links.read().clone()
    }

    fn publish(&self, identity: &str, state: PeerState, media: Option<R>) {
        let _ = self.events.send(MeshEvent::Link {
            identity: identity.to_string(),
            state,
            media,
            live: state.is_live(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn renegotiation_keeps_surfaced_media() {
        let (board, mut rx) = LinkBoard::<String>::new();
        board.transition("bob", PeerState::Negotiating);
        board.surface("bob", PeerState::Connected, "bob-audio".into());
        board.transition("bob", PeerState::Renegotiating);

        let link = board.get("bob").unwrap();
        assert_eq!(link.state, PeerState::Renegotiating);
        assert_eq!(link.media.as_deref(), Some("bob-audio"));
        assert!(link.live);

        let mut seen = Vec::new();
        while let Ok(MeshEvent::Link { state, media, .. }) = rx.try_recv() {
            seen.push((state, media));
        }
        assert_eq!(
            seen,
            vec![
                (PeerState::Negotiating, None),
                (PeerState::Connected, Some("bob-audio".to_string())),
                (PeerState::Renegotiating, Some("bob-audio".to_string())),
            ]
        );
    }

    #[test_timeout::timeout]
    fn closed_removes_link() {
        let (board, mut rx) = LinkBoard::<String>::new();
        board.surface("bob", PeerState::Connected, "bob-audio".into());
        board.transition("bob", PeerState::Closed);
        assert!(board.get("bob").is_none());
        assert!(board.snapshot().is_empty());

        let _ = rx.try_recv();
        match rx.try_recv() {
            Ok(MeshEvent::Link {
                state, media, live, ..
            }) => {
                assert_eq!(state, PeerState::Closed);
                assert!(media.is_none());
                assert!(!live);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
