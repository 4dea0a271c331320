use std::sync::Arc;

use async_trait::async_trait;
use mesh_proto::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{MediaAttach, PeerTransport, TransportEvent, TransportFactory, TransportState};
use crate::error::PeerError;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;
pub type RemoteTrack = Arc<TrackRemote>;

/// Builds one `RTCPeerConnection` per remote identity, sharing a single
/// API instance with the default codecs and interceptors registered.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFactory {
    pub fn new(ice_urls: &[String]) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    type Transport = WebRtcTransport;

    async fn create(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<TransportEvent<RemoteTrack>>,
    ) -> Result<Arc<WebRtcTransport>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let candidate_tx = events.clone();
        let remote_for_candidates = remote.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let remote = remote_for_candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "mesh", identity = %remote, error = %err, "candidate serialization failed");
                    }
                }
            })
        }));

        let state_tx = events.clone();
        let remote_for_state = remote.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(target = "mesh", identity = %remote_for_state, ?state, "peer connection state changed");
            let mapped = match state {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    TransportState::New
                }
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
            };
            let _ = state_tx.send(TransportEvent::StateChanged(mapped));
            Box::pin(async {})
        }));

        let track_tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = track_tx.send(TransportEvent::RemoteMedia(track));
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcTransport {
            remote: remote.to_string(),
            pc,
            sender: AsyncMutex::new(None),
        }))
    }
}

pub struct WebRtcTransport {
    remote: String,
    pc: Arc<RTCPeerConnection>,
    sender: AsyncMutex<Option<Arc<RTCRtpSender>>>,
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let sdp = description.sdp;
    let rtc = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpType::Rollback => {
            return Err(PeerError::InvalidNegotiationState(
                "rollback descriptions are not supported".into(),
            ))
        }
    };
    Ok(rtc)
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    type LocalMedia = LocalTrack;
    type RemoteMedia = RemoteTrack;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let rtc = to_rtc_description(description)?;
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn rollback_local_offer(&self) -> Result<(), PeerError> {
        let Some(mut rollback) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn attach_media(&self, media: LocalTrack) -> Result<MediaAttach, PeerError> {
        let mut sender = self.sender.lock().await;
        if let Some(existing) = sender.as_ref() {
            existing.replace_track(Some(media)).await?;
            return Ok(MediaAttach::Replaced);
        }

        let rtp_sender = self.pc.add_track(media).await?;
        // RTCP has to be read for interceptors (NACK, reports) to run.
        let reader = Arc::clone(&rtp_sender);
        let remote = self.remote.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
            tracing::trace!(target = "mesh", identity = %remote, "rtcp reader ended");
        });
        *sender = Some(rtp_sender);
        Ok(MediaAttach::Added)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}
