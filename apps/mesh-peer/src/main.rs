use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_peer_core::transport::rtc::{LocalTrack, WebRtcFactory};
use mesh_peer_core::{LocalMedia, Mesh, MeshConfig, MeshEvent, PeerConfig, SignalingClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Parser, Debug)]
#[command(name = "mesh-peer")]
#[command(about = "Join a mesh room and keep an audio link to every other participant")]
struct Cli {
    /// Relay WebSocket URL (defaults to MESH_SIGNALING_URL)
    #[arg(short, long)]
    url: Option<String>,

    /// Identity to register as
    #[arg(short, long)]
    identity: String,

    /// ICE server URL; repeat for several (defaults to MESH_ICE_SERVERS)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,
}

fn opus_track(identity: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        "audio".to_owned(),
        format!("mesh-{identity}"),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mesh_peer_core=info,mesh_peer=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PeerConfig::from_env();
    if let Some(url) = cli.url {
        config.signaling_url = url;
    }
    if !cli.ice_servers.is_empty() {
        config.ice_servers = cli.ice_servers;
    }

    let factory = Arc::new(WebRtcFactory::new(&config.ice_servers).context("building webrtc api")?);
    let client = SignalingClient::connect(&config.signaling_url, &cli.identity)
        .await
        .with_context(|| format!("joining {}", config.signaling_url))?;
    let server_events = client
        .events()
        .context("signaling event stream already taken")?;

    let (mesh, mut mesh_events) = Mesh::new(
        client.identity(),
        factory,
        MeshConfig::default(),
        client.sender(),
    );
    mesh.set_local_media(LocalMedia::Ready(opus_track(&cli.identity)))
        .await;
    client.ready()?;
    info!("joined mesh as {}", cli.identity);

    let runner = tokio::spawn(Arc::clone(&mesh).run(server_events));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; leaving mesh");
                break;
            }
            event = mesh_events.recv() => match event {
                Some(MeshEvent::Link { identity, state, media, live }) => {
                    info!(%identity, %state, live, media = media.is_some(), "link update");
                }
                Some(MeshEvent::SetupFailed { reason }) => warn!(%reason, "local media setup failed"),
                None => break,
            }
        }
    }

    client.close();
    mesh.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(5), runner).await.is_err() {
        warn!("mesh runner did not stop in time");
    }
    Ok(())
}
