//! One negotiated link to one remote identity.
//!
//! Every session is a single tokio task that owns its transport and
//! processes remote signals, transport events, media updates and its
//! renegotiation deadline strictly in arrival order. SDP and ICE
//! application is order sensitive, so nothing else touches the transport
//! while the task is alive.

mod state;

pub use state::{PeerState, Role};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_proto::{ClientMessage, Identity, IceCandidate, NegotiationPayload, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::error::PeerError;
use crate::links::LinkBoard;
use crate::transport::{MediaAttach, PeerTransport, TransportEvent, TransportFactory, TransportState};

enum SessionInput<L> {
    Signal(NegotiationPayload),
    AttachMedia(L),
}

/// The orchestrator's grip on a running session.
pub struct PeerSessionHandle<T: PeerTransport> {
    remote: Identity,
    role: Role,
    inputs: mpsc::UnboundedSender<SessionInput<T::LocalMedia>>,
    transport: Arc<T>,
    board: LinkBoard<T::RemoteMedia>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<T: PeerTransport> PeerSessionHandle<T> {
    /// Create the transport for `remote` and start driving it. An offerer
    /// sends its first offer right away; an answerer waits for one.
    pub async fn spawn<F>(
        factory: &F,
        remote: &str,
        role: Role,
        local_media: Option<T::LocalMedia>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        board: LinkBoard<T::RemoteMedia>,
        config: MeshConfig,
    ) -> Result<Arc<Self>, PeerError>
    where
        F: TransportFactory<Transport = T>,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = factory.create(remote, events_tx).await?;
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

        board.transition(remote, PeerState::Idle);
        let session = PeerSession {
            remote: remote.to_string(),
            role,
            state: PeerState::Idle,
            transport: Arc::clone(&transport),
            outbound,
            board: board.clone(),
            config,
            remote_description_set: false,
            local_offer_pending: false,
            media_offer_needed: false,
            pending_candidates: VecDeque::new(),
            restart_attempts: 0,
            deadline: None,
            transport_state: TransportState::New,
            remote_media: None,
        };
        let task = tokio::spawn(session.run(inputs_rx, events_rx, local_media));
        info!(target = "mesh", identity = %remote, ?role, "peer session started");

        Ok(Arc::new(Self {
            remote: remote.to_string(),
            role,
            inputs: inputs_tx,
            transport,
            board,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue a remote negotiation payload.
    pub fn deliver(&self, payload: NegotiationPayload) -> Result<(), PeerError> {
        self.inputs
            .send(SessionInput::Signal(payload))
            .map_err(|_| PeerError::SessionClosed)
    }

    /// Queue new or replacement outbound media.
    pub fn attach_media(&self, media: T::LocalMedia) -> Result<(), PeerError> {
        self.inputs
            .send(SessionInput::AttachMedia(media))
            .map_err(|_| PeerError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the session task, release the transport and publish `Closed`.
    /// Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(target = "mesh", identity = %self.remote, "session already closed");
            return;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if let Err(err) = self.transport.close().await {
            warn!(target = "mesh", identity = %self.remote, error = %err, "transport close failed");
        }
        self.board.transition(&self.remote, PeerState::Closed);
        info!(target = "mesh", identity = %self.remote, "peer session closed");
    }
}

impl<T: PeerTransport> Drop for PeerSessionHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct PeerSession<T: PeerTransport> {
    remote: Identity,
    role: Role,
    state: PeerState,
    transport: Arc<T>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    board: LinkBoard<T::RemoteMedia>,
    config: MeshConfig,
    remote_description_set: bool,
    local_offer_pending: bool,
    /// Outbound media was added mid-negotiation and still needs its own offer.
    media_offer_needed: bool,
    pending_candidates: VecDeque<IceCandidate>,
    restart_attempts: u32,
    deadline: Option<Instant>,
    transport_state: TransportState,
    remote_media: Option<T::RemoteMedia>,
}

impl<T: PeerTransport> PeerSession<T> {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput<T::LocalMedia>>,
        mut events: mpsc::UnboundedReceiver<TransportEvent<T::RemoteMedia>>,
        local_media: Option<T::LocalMedia>,
    ) {
        if let Some(media) = local_media {
            if let Err(err) = self.attach_media(media).await {
                warn!(target = "mesh", identity = %self.remote, error = %err, "attaching outbound media failed");
            }
        }
        if self.role == Role::Offerer {
            self.set_state(PeerState::Negotiating);
            if let Err(err) = self.send_offer(false).await {
                warn!(target = "mesh", identity = %self.remote, error = %err, "initial offer failed");
            }
        }

        loop {
            let deadline = self.deadline;
            let result = tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::Signal(payload)) => self.on_signal(payload).await,
                    Some(SessionInput::AttachMedia(media)) => self.attach_media(media).await,
                    None => break,
                },
                Some(event) = events.recv() => self.on_transport_event(event).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    self.on_deadline().await
                }
            };

            match result {
                Ok(()) => {}
                Err(PeerError::InvalidNegotiationState(reason)) => {
                    debug!(target = "mesh", identity = %self.remote, state = %self.state, %reason, "dropping out-of-state input");
                }
                Err(err) => {
                    warn!(target = "mesh", identity = %self.remote, state = %self.state, error = %err, "negotiation step failed");
                }
            }
        }
        debug!(target = "mesh", identity = %self.remote, "session input closed");
    }

    async fn on_signal(&mut self, payload: NegotiationPayload) -> Result<(), PeerError> {
        match payload {
            NegotiationPayload::Description(description) => match description.kind {
                SdpType::Offer => self.on_remote_offer(description).await,
                SdpType::Answer | SdpType::Pranswer => self.on_remote_answer(description).await,
                SdpType::Rollback => Err(PeerError::InvalidNegotiationState(
                    "rollback is not supported".into(),
                )),
            },
            NegotiationPayload::Candidate(candidate) => {
                if self.remote_description_set {
                    self.transport.add_ice_candidate(candidate).await
                } else {
                    trace!(target = "mesh", identity = %self.remote, queued = self.pending_candidates.len() + 1, "queueing early candidate");
                    self.pending_candidates.push_back(candidate);
                    Ok(())
                }
            }
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<(), PeerError> {
        if self.local_offer_pending {
            // Glare: the offerer keeps its offer, the answerer yields.
            if self.role == Role::Offerer {
                return Err(PeerError::InvalidNegotiationState(
                    "remote offer while our own offer is outstanding".into(),
                ));
            }
            debug!(target = "mesh", identity = %self.remote, "yielding our offer to the remote one");
            self.withdraw_local_offer().await?;
        }

        match self.state {
            PeerState::Idle => self.set_state(PeerState::Negotiating),
            PeerState::Connected | PeerState::Failed => {
                info!(target = "mesh", identity = %self.remote, "remote restarted negotiation");
                self.set_state(PeerState::Renegotiating);
                self.deadline = Some(Instant::now() + self.config.renegotiation_timeout);
            }
            PeerState::Negotiating | PeerState::Renegotiating => {}
            PeerState::Closed => return Err(PeerError::SessionClosed),
        }

        self.transport.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.send(NegotiationPayload::Description(answer));

        if self.state == PeerState::Renegotiating && self.transport_state == TransportState::Connected {
            self.enter_connected().await?;
        }
        Ok(())
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        if !self.local_offer_pending {
            return Err(PeerError::InvalidNegotiationState(
                "answer without an outstanding offer".into(),
            ));
        }

        let provisional = answer.kind == SdpType::Pranswer;
        self.transport.set_remote_description(answer).await?;
        self.remote_description_set = true;
        if !provisional {
            self.local_offer_pending = false;
        }
        self.flush_candidates().await;

        if !provisional
            && self.state == PeerState::Renegotiating
            && self.transport_state == TransportState::Connected
        {
            self.enter_connected().await?;
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                warn!(target = "mesh", identity = %self.remote, error = %err, "queued candidate rejected");
            }
        }
    }

    async fn on_transport_event(
        &mut self,
        event: TransportEvent<T::RemoteMedia>,
    ) -> Result<(), PeerError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(NegotiationPayload::Candidate(candidate));
                Ok(())
            }
            TransportEvent::RemoteMedia(media) => {
                self.remote_media = Some(media.clone());
                if self.state == PeerState::Connected {
                    self.board.surface(&self.remote, PeerState::Connected, media);
                }
                Ok(())
            }
            TransportEvent::StateChanged(state) => {
                self.transport_state = state;
                match state {
                    TransportState::Connected => {
                        if matches!(
                            self.state,
                            PeerState::Negotiating | PeerState::Renegotiating | PeerState::Failed
                        ) {
                            self.enter_connected().await?;
                        }
                        Ok(())
                    }
                    TransportState::Failed => self.on_transport_failure().await,
                    TransportState::Disconnected => {
                        debug!(target = "mesh", identity = %self.remote, "transport disconnected; waiting");
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    async fn on_transport_failure(&mut self) -> Result<(), PeerError> {
        match self.state {
            PeerState::Negotiating | PeerState::Connected => {}
            PeerState::Renegotiating => {
                debug!(target = "mesh", identity = %self.remote, "transport failed mid-restart; waiting for deadline");
                return Ok(());
            }
            _ => return Ok(()),
        }

        warn!(target = "mesh", identity = %self.remote, "transport failed");
        self.set_state(PeerState::Renegotiating);
        match self.role {
            Role::Offerer => self.restart().await,
            Role::Answerer => {
                // Give the offerer one timeout to restart before we do.
                self.deadline = Some(Instant::now() + self.config.renegotiation_timeout);
                Ok(())
            }
        }
    }

    async fn on_deadline(&mut self) -> Result<(), PeerError> {
        if self.state != PeerState::Renegotiating {
            return Ok(());
        }
        if self.transport_state == TransportState::Connected && !self.local_offer_pending {
            return self.enter_connected().await;
        }
        debug!(target = "mesh", identity = %self.remote, attempts = self.restart_attempts, "renegotiation timed out");
        self.restart().await
    }

    /// Issue one ICE-restart offer, or give up once the budget is spent.
    async fn restart(&mut self) -> Result<(), PeerError> {
        if self.restart_attempts >= self.config.max_restart_attempts {
            self.deadline = None;
            // Failed must still accept a remote offer.
            if self.local_offer_pending {
                if let Err(err) = self.withdraw_local_offer().await {
                    debug!(target = "mesh", identity = %self.remote, error = %err, "rollback failed");
                }
                self.local_offer_pending = false;
            }
            self.set_state(PeerState::Failed);
            return Err(PeerError::TransportFailure(format!(
                "gave up after {} restart attempts",
                self.restart_attempts
            )));
        }

        self.restart_attempts += 1;
        self.deadline = Some(Instant::now() + self.config.renegotiation_timeout);
        // Candidates for the new ICE session must wait for the new answer.
        self.remote_description_set = false;
        info!(target = "mesh", identity = %self.remote, attempt = self.restart_attempts, "sending ice restart offer");
        self.send_offer(true).await
    }

    async fn attach_media(&mut self, media: T::LocalMedia) -> Result<(), PeerError> {
        let attached = self.transport.attach_media(media).await?;
        if attached == MediaAttach::Replaced {
            return Ok(());
        }
        match self.state {
            // The first offer or answer will carry it.
            PeerState::Idle => Ok(()),
            PeerState::Connected => self.offer_new_media().await,
            _ => {
                self.media_offer_needed = true;
                Ok(())
            }
        }
    }

    async fn offer_new_media(&mut self) -> Result<(), PeerError> {
        debug!(target = "mesh", identity = %self.remote, "renegotiating to add outbound media");
        self.media_offer_needed = false;
        self.set_state(PeerState::Renegotiating);
        self.deadline = Some(Instant::now() + self.config.renegotiation_timeout);
        self.send_offer(false).await
    }

    async fn withdraw_local_offer(&mut self) -> Result<(), PeerError> {
        self.transport.rollback_local_offer().await?;
        self.local_offer_pending = false;
        Ok(())
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), PeerError> {
        let offer = self.transport.create_offer(ice_restart).await?;
        self.local_offer_pending = true;
        self.send(NegotiationPayload::Description(offer));
        Ok(())
    }

    async fn enter_connected(&mut self) -> Result<(), PeerError> {
        self.deadline = None;
        self.restart_attempts = 0;
        self.set_state(PeerState::Connected);
        if self.media_offer_needed {
            self.offer_new_media().await?;
        }
        Ok(())
    }

    fn set_state(&mut self, state: PeerState) {
        if self.state == state {
            return;
        }
        debug!(target = "mesh", identity = %self.remote, from = %self.state, to = %state, "session state");
        self.state = state;
        match (&self.remote_media, state) {
            (Some(media), PeerState::Connected) => {
                self.board.surface(&self.remote, state, media.clone())
            }
            _ => self.board.transition(&self.remote, state),
        }
    }

    fn send(&self, payload: NegotiationPayload) {
        let message = match payload.into_message(&self.remote) {
            Ok(message) => message,
            Err(err) => {
                warn!(target = "mesh", identity = %self.remote, error = %err, "failed to encode negotiation payload");
                return;
            }
        };
        if self.outbound.send(message).is_err() {
            debug!(target = "mesh", identity = %self.remote, "signaling channel closed; payload dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::MeshEvent;
    use crate::transport::mock::{Call, MockFactory, MockTransport};
    use std::time::Duration;

    struct Harness {
        factory: MockFactory,
        board: LinkBoard<String>,
        events: mpsc::UnboundedReceiver<MeshEvent<String>>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        handle: Arc<PeerSessionHandle<MockTransport>>,
    }

    impl Harness {
        async fn start(role: Role, media: Option<&str>) -> Self {
            let factory = MockFactory::new();
            let (board, events) = LinkBoard::new();
            let (outbound_tx, outbound) = mpsc::unbounded_channel();
            let handle = PeerSessionHandle::spawn(
                &factory,
                "bob",
                role,
                media.map(str::to_string),
                outbound_tx,
                board.clone(),
                MeshConfig::default(),
            )
            .await
            .unwrap();
            Self {
                factory,
                board,
                events,
                outbound,
                handle,
            }
        }

        fn transport(&self) -> Arc<MockTransport> {
            self.factory.transport("bob").unwrap()
        }

        fn emit(&self, event: TransportEvent<String>) {
            assert!(self.factory.emit("bob", event));
        }

        async fn sent(&mut self) -> NegotiationPayload {
            match self.outbound.recv().await.expect("outbound closed") {
                ClientMessage::Negotiate { recipient, payload } => {
                    assert_eq!(recipient, "bob");
                    NegotiationPayload::from_value(&payload).unwrap()
                }
                other => panic!("unexpected outbound message: {:?}", other),
            }
        }

        async fn sent_description(&mut self) -> SessionDescription {
            loop {
                if let NegotiationPayload::Description(description) = self.sent().await {
                    return description;
                }
            }
        }

        async fn state(&mut self) -> (PeerState, Option<String>, bool) {
            loop {
                match self.events.recv().await.expect("board closed") {
                    MeshEvent::Link {
                        state, media, live, ..
                    } => return (state, media, live),
                    MeshEvent::SetupFailed { .. } => continue,
                }
            }
        }

        async fn until_state(&mut self, wanted: PeerState) -> (Option<String>, bool) {
            loop {
                let (state, media, live) = self.state().await;
                if state == wanted {
                    return (media, live);
                }
            }
        }

        /// Offerer path: offer out, answer in, transport up.
        async fn connect_as_offerer(&mut self) {
            let offer = self.sent_description().await;
            assert_eq!(offer.kind, SdpType::Offer);
            self.handle
                .deliver(NegotiationPayload::Description(SessionDescription::answer("remote-answer")))
                .unwrap();
            self.emit(TransportEvent::RemoteMedia("bob-audio".into()));
            self.emit(TransportEvent::StateChanged(TransportState::Connected));
            self.until_state(PeerState::Connected).await;
        }
    }

    fn candidate(name: &str) -> NegotiationPayload {
        NegotiationPayload::Candidate(IceCandidate {
            candidate: name.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offerer_attaches_media_then_offers() {
        let mut h = Harness::start(Role::Offerer, Some("mic")).await;
        let offer = h.sent_description().await;
        assert_eq!(offer.kind, SdpType::Offer);
        assert_eq!(
            h.transport().calls(),
            vec![
                Call::AttachMedia("mic".into()),
                Call::CreateOffer { ice_restart: false }
            ]
        );
        assert_eq!(h.state().await.0, PeerState::Idle);
        assert_eq!(h.state().await.0, PeerState::Negotiating);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn early_candidates_apply_after_offer_in_order() {
        let mut h = Harness::start(Role::Answerer, None).await;
        h.handle.deliver(candidate("c1")).unwrap();
        h.handle.deliver(candidate("c2")).unwrap();
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("remote-offer")))
            .unwrap();

        let answer = h.sent_description().await;
        assert_eq!(answer.kind, SdpType::Answer);
        assert_eq!(
            h.transport().calls(),
            vec![
                Call::SetRemote(SdpType::Offer),
                Call::AddCandidate("c1".into()),
                Call::AddCandidate("c2".into()),
                Call::CreateAnswer,
            ]
        );

        h.handle.deliver(candidate("c3")).unwrap();
        let transport = h.transport();
        settle(|| transport.count(&Call::AddCandidate("c3".into())) == 1).await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connected_surfaces_media_once() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.connect_as_offerer().await;
        let link = h.board.get("bob").unwrap();
        assert_eq!(link.state, PeerState::Connected);
        assert_eq!(link.media.as_deref(), Some("bob-audio"));
        assert!(link.live);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failure_restarts_once_and_recovers() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.connect_as_offerer().await;

        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        let (media, live) = h.until_state(PeerState::Renegotiating).await;
        assert_eq!(media.as_deref(), Some("bob-audio"));
        assert!(live);

        let restart = h.sent_description().await;
        assert_eq!(restart.kind, SdpType::Offer);
        assert_eq!(h.transport().count(&Call::CreateOffer { ice_restart: true }), 1);

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::answer("restart-answer")))
            .unwrap();
        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        let (media, live) = h.until_state(PeerState::Connected).await;
        assert_eq!(media.as_deref(), Some("bob-audio"));
        assert!(live);
        assert_eq!(h.transport().count(&Call::CreateOffer { ice_restart: true }), 1);
        assert_eq!(h.transport().count(&Call::SetRemote(SdpType::Answer)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_restarts_end_in_failed() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.connect_as_offerer().await;

        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        let (_, live) = h.until_state(PeerState::Failed).await;
        assert!(!live);
        assert_eq!(
            h.transport().count(&Call::CreateOffer { ice_restart: true }),
            MeshConfig::default().max_restart_attempts as usize
        );
        assert!(!h.board.get("bob").unwrap().live);
    }

    #[tokio::test(start_paused = true)]
    async fn answerer_waits_before_its_own_restart() {
        let mut h = Harness::start(Role::Answerer, None).await;
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("remote-offer")))
            .unwrap();
        h.sent_description().await;
        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        h.until_state(PeerState::Connected).await;

        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        h.until_state(PeerState::Renegotiating).await;
        assert_eq!(h.transport().count(&Call::CreateOffer { ice_restart: true }), 0);

        // Nothing from the offerer: after one timeout the answerer restarts itself.
        let restart = h.sent_description().await;
        assert_eq!(restart.kind, SdpType::Offer);
        assert_eq!(h.transport().count(&Call::CreateOffer { ice_restart: true }), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn answerer_answers_remote_restart() {
        let mut h = Harness::start(Role::Answerer, None).await;
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("remote-offer")))
            .unwrap();
        h.sent_description().await;
        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        h.until_state(PeerState::Connected).await;

        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        h.until_state(PeerState::Renegotiating).await;
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("restart-offer")))
            .unwrap();
        assert_eq!(h.sent_description().await.kind, SdpType::Answer);

        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        h.until_state(PeerState::Connected).await;
        assert_eq!(h.transport().count(&Call::CreateOffer { ice_restart: true }), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_negotiating_uses_bounded_restarts() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.sent_description().await;

        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        let (_, live) = h.until_state(PeerState::Failed).await;
        assert!(!live);
        assert_eq!(
            h.transport().count(&Call::CreateOffer { ice_restart: true }),
            MeshConfig::default().max_restart_attempts as usize
        );
        assert_eq!(h.transport().count(&Call::Rollback), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn answerer_failure_while_negotiating_waits_then_gives_up() {
        let mut h = Harness::start(Role::Answerer, None).await;
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("remote-offer")))
            .unwrap();
        h.sent_description().await;

        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        h.until_state(PeerState::Renegotiating).await;
        assert_eq!(h.transport().count(&Call::CreateOffer { ice_restart: true }), 0);

        h.until_state(PeerState::Failed).await;
        assert_eq!(
            h.transport().count(&Call::CreateOffer { ice_restart: true }),
            MeshConfig::default().max_restart_attempts as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_answers_a_remote_restart() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.connect_as_offerer().await;
        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        h.until_state(PeerState::Failed).await;

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("peer-restart")))
            .unwrap();
        h.until_state(PeerState::Renegotiating).await;
        while h.sent_description().await.kind != SdpType::Answer {}
        let transport = h.transport();
        assert_eq!(transport.count(&Call::SetRemote(SdpType::Offer)), 1);
        assert_eq!(transport.count(&Call::CreateAnswer), 1);

        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        let (media, live) = h.until_state(PeerState::Connected).await;
        assert_eq!(media.as_deref(), Some("bob-audio"));
        assert!(live);
    }

    #[tokio::test(start_paused = true)]
    async fn answerer_yields_its_restart_to_a_concurrent_one() {
        let mut h = Harness::start(Role::Answerer, None).await;
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("remote-offer")))
            .unwrap();
        h.sent_description().await;
        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        h.until_state(PeerState::Connected).await;

        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        h.until_state(PeerState::Renegotiating).await;
        assert_eq!(h.sent_description().await.kind, SdpType::Offer);

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("offerer-restart")))
            .unwrap();
        assert_eq!(h.sent_description().await.kind, SdpType::Answer);
        let calls = h.transport().calls();
        assert_eq!(
            calls[calls.len() - 4..].to_vec(),
            vec![
                Call::CreateOffer { ice_restart: true },
                Call::Rollback,
                Call::SetRemote(SdpType::Offer),
                Call::CreateAnswer,
            ]
        );

        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        h.until_state(PeerState::Connected).await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offerer_keeps_its_restart_on_glare() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.connect_as_offerer().await;
        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        assert_eq!(h.sent_description().await.kind, SdpType::Offer);

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("answerer-restart")))
            .unwrap();
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::answer("restart-answer")))
            .unwrap();

        let transport = h.transport();
        settle(|| transport.count(&Call::SetRemote(SdpType::Answer)) == 2).await;
        assert_eq!(transport.count(&Call::SetRemote(SdpType::Offer)), 0);
        assert_eq!(transport.count(&Call::Rollback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_recovery_revives_failed_session() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.connect_as_offerer().await;
        h.emit(TransportEvent::StateChanged(TransportState::Failed));
        h.until_state(PeerState::Failed).await;

        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        let (media, live) = h.until_state(PeerState::Connected).await;
        assert_eq!(media.as_deref(), Some("bob-audio"));
        assert!(live);
        assert!(h.board.get("bob").unwrap().live);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn media_added_mid_negotiation_is_offered_once_connected() {
        let mut h = Harness::start(Role::Offerer, None).await;
        assert_eq!(h.sent_description().await.kind, SdpType::Offer);

        h.handle.attach_media("mic".into()).unwrap();
        let transport = h.transport();
        settle(|| transport.count(&Call::AttachMedia("mic".into())) == 1).await;
        assert_eq!(transport.count(&Call::CreateOffer { ice_restart: false }), 1);

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::answer("remote-answer")))
            .unwrap();
        settle(|| transport.count(&Call::SetRemote(SdpType::Answer)) == 1).await;
        h.emit(TransportEvent::StateChanged(TransportState::Connected));
        h.until_state(PeerState::Connected).await;
        h.until_state(PeerState::Renegotiating).await;
        assert_eq!(h.sent_description().await.kind, SdpType::Offer);
        assert_eq!(transport.count(&Call::CreateOffer { ice_restart: false }), 2);

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::answer("media-answer")))
            .unwrap();
        h.until_state(PeerState::Connected).await;
        assert_eq!(transport.count(&Call::CreateOffer { ice_restart: false }), 2);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn glare_offer_is_dropped() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.sent_description().await;

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("glare")))
            .unwrap();
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::answer("answer")))
            .unwrap();

        let transport = h.transport();
        settle(|| transport.count(&Call::SetRemote(SdpType::Answer)) == 1).await;
        assert_eq!(transport.count(&Call::SetRemote(SdpType::Offer)), 0);
        assert_eq!(transport.count(&Call::CreateAnswer), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stray_answer_is_dropped() {
        let mut h = Harness::start(Role::Answerer, None).await;
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::answer("stray")))
            .unwrap();
        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::offer("real")))
            .unwrap();

        assert_eq!(h.sent_description().await.kind, SdpType::Answer);
        assert_eq!(
            h.transport().calls(),
            vec![Call::SetRemote(SdpType::Offer), Call::CreateAnswer]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn new_media_while_connected_renegotiates() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.connect_as_offerer().await;

        h.handle.attach_media("mic".into()).unwrap();
        h.until_state(PeerState::Renegotiating).await;
        let offer = h.sent_description().await;
        assert_eq!(offer.kind, SdpType::Offer);
        assert_eq!(h.transport().count(&Call::CreateOffer { ice_restart: false }), 2);

        h.handle
            .deliver(NegotiationPayload::Description(SessionDescription::answer("media-answer")))
            .unwrap();
        h.until_state(PeerState::Connected).await;

        // Swapping the track needs no new offer.
        h.handle.attach_media("mic-2".into()).unwrap();
        let transport = h.transport();
        settle(|| transport.count(&Call::AttachMedia("mic-2".into())) == 1).await;
        assert_eq!(transport.count(&Call::CreateOffer { ice_restart: false }), 2);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_is_idempotent() {
        let mut h = Harness::start(Role::Offerer, None).await;
        h.sent_description().await;

        h.handle.close().await;
        h.handle.close().await;

        assert!(h.handle.is_closed());
        assert_eq!(h.transport().count(&Call::Close), 1);
        assert!(h.board.get("bob").is_none());
        assert!(h.handle.deliver(candidate("late")).is_err());

        let mut closed = 0;
        while let Ok(event) = h.events.try_recv() {
            if let MeshEvent::Link {
                state: PeerState::Closed,
                ..
            } = event
            {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }
}
