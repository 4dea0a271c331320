//! Keeps one peer session per remote identity in the room and routes
//! relay traffic to them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use mesh_proto::{ClientMessage, Identity, NegotiationPayload, ServerMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::PeerError;
use crate::links::{LinkBoard, MeshEvent, PeerLink};
use crate::session::{PeerSessionHandle, Role};
use crate::transport::{LocalMediaOf, RemoteMediaOf, TransportFactory};

/// Outbound media as reported by whatever captures it.
#[derive(Debug, Clone)]
pub enum LocalMedia<L> {
    Ready(L),
    Unavailable(String),
}

enum MediaState<L> {
    Pending,
    Ready(L),
    Unavailable(String),
}

type Handle<F> = Arc<PeerSessionHandle<<F as TransportFactory>::Transport>>;

pub struct Mesh<F: TransportFactory> {
    local: Identity,
    factory: Arc<F>,
    config: MeshConfig,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    board: LinkBoard<RemoteMediaOf<F>>,
    sessions: AsyncMutex<HashMap<Identity, Handle<F>>>,
    early: Mutex<HashMap<Identity, VecDeque<NegotiationPayload>>>,
    media: Mutex<MediaState<LocalMediaOf<F>>>,
}

impl<F: TransportFactory> Mesh<F> {
    /// `outbound` is where sessions write their negotiate messages; normally
    /// [`SignalingClient::sender`](crate::signaling::SignalingClient::sender).
    pub fn new(
        local: &str,
        factory: Arc<F>,
        config: MeshConfig,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent<RemoteMediaOf<F>>>) {
        let (board, events) = LinkBoard::new();
        let mesh = Arc::new(Self {
            local: local.to_string(),
            factory,
            config,
            outbound,
            board,
            sessions: AsyncMutex::new(HashMap::new()),
            early: Mutex::new(HashMap::new()),
            media: Mutex::new(MediaState::Pending),
        });
        (mesh, events)
    }

    pub fn local_identity(&self) -> &str {
        &self.local
    }

    /// Pump relay events until the signaling connection ends, then tear
    /// every session down.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ServerMessage>) {
        while let Some(message) = events.recv().await {
            self.handle_server_message(message).await;
        }
        info!(target = "mesh", "signaling stream ended");
        self.shutdown().await;
    }

    pub async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::PeerJoin {
                identity,
                is_offerer,
            } => {
                if let Err(err) = self.on_peer_join(&identity, Role::from_is_offerer(is_offerer)).await {
                    warn!(target = "mesh", %identity, error = %err, "could not start peer session");
                }
            }
            ServerMessage::PeerLeave { identity } => self.on_peer_leave(&identity).await,
            ServerMessage::Negotiate { sender, payload } => {
                match NegotiationPayload::from_value(&payload) {
                    Ok(payload) => self.on_negotiate(&sender, payload).await,
                    Err(err) => {
                        warn!(target = "mesh", identity = %sender, error = %err, "dropping malformed negotiation payload")
                    }
                }
            }
            ServerMessage::Error {
                kind,
                message,
                identity,
            } => {
                warn!(target = "mesh", ?kind, identity = ?identity, "relay error: {}", message);
            }
            other @ (ServerMessage::RegisterAck { .. } | ServerMessage::Pong) => {
                debug!(target = "mesh", "ignoring {:?}", other);
            }
        }
    }

    async fn on_peer_join(&self, identity: &str, role: Role) -> Result<(), PeerError> {
        if identity == self.local {
            warn!(target = "mesh", %identity, "relay announced us to ourselves; ignoring");
            return Ok(());
        }

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(identity) {
            debug!(target = "mesh", %identity, "duplicate peer_join ignored");
            return Ok(());
        }

        let media = match &*self.media.lock() {
            MediaState::Unavailable(reason) => {
                return Err(PeerError::SetupFailure(reason.clone()));
            }
            MediaState::Ready(media) => Some(media.clone()),
            MediaState::Pending => None,
        };

        let handle = PeerSessionHandle::spawn(
            &*self.factory,
            identity,
            role,
            media,
            self.outbound.clone(),
            self.board.clone(),
            self.config.clone(),
        )
        .await?;

        let buffered = self.early.lock().remove(identity).unwrap_or_default();
        if !buffered.is_empty() {
            debug!(target = "mesh", %identity, count = buffered.len(), "replaying early signals");
        }
        for payload in buffered {
            handle.deliver(payload)?;
        }

        sessions.insert(identity.to_string(), handle);
        info!(target = "mesh", %identity, ?role, "peer joined");
        Ok(())
    }

    async fn on_peer_leave(&self, identity: &str) {
        self.early.lock().remove(identity);
        let removed = self.sessions.lock().await.remove(identity);
        match removed {
            Some(handle) => {
                handle.close().await;
                info!(target = "mesh", %identity, "peer left");
            }
            None => debug!(target = "mesh", %identity, "peer_leave for unknown session"),
        }
    }

    async fn on_negotiate(&self, sender: &str, payload: NegotiationPayload) {
        let sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(sender) {
            if let Err(err) = handle.deliver(payload) {
                debug!(target = "mesh", identity = %sender, error = %err, "session gone; dropping signal");
            }
            return;
        }
        drop(sessions);

        let mut early = self.early.lock();
        let queue = early.entry(sender.to_string()).or_default();
        if queue.len() >= self.config.early_signal_limit {
            warn!(target = "mesh", identity = %sender, limit = self.config.early_signal_limit, "early signal buffer full; dropping");
            return;
        }
        queue.push_back(payload);
    }

    /// Update outbound media on every session, or record that it is unavailable.
    pub async fn set_local_media(&self, media: LocalMedia<LocalMediaOf<F>>) {
        match media {
            LocalMedia::Ready(media) => {
                *self.media.lock() = MediaState::Ready(media.clone());
                let handles: Vec<Handle<F>> =
                    self.sessions.lock().await.values().cloned().collect();
                for handle in handles {
                    if let Err(err) = handle.attach_media(media.clone()) {
                        debug!(target = "mesh", identity = %handle.remote(), error = %err, "session gone; media not attached");
                    }
                }
            }
            LocalMedia::Unavailable(reason) => {
                warn!(target = "mesh", %reason, "local media unavailable");
                self.board.setup_failed(&reason);
                *self.media.lock() = MediaState::Unavailable(reason);
            }
        }
    }

    /// Close every session. Safe to call more than once.
    pub async fn shutdown(&self) {
        let handles: Vec<Handle<F>> = self.sessions.lock().await.drain().map(|(_, h)| h).collect();
        self.early.lock().clear();
        for handle in handles {
            handle.close().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn links(&self) -> HashMap<Identity, PeerLink<RemoteMediaOf<F>>> {
        self.board.snapshot()
    }

    pub fn link(&self, identity: &str) -> Option<PeerLink<RemoteMediaOf<F>>> {
        self.board.get(identity)
    }

    pub fn is_live(&self, identity: &str) -> bool {
        self.board.get(identity).map(|link| link.live).unwrap_or(false)
    }
}
