use std::env;
use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Tuning for peer sessions and the orchestrator.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Restart offers a session may issue before it gives up and enters `Failed`.
    pub max_restart_attempts: u32,
    /// How long one renegotiation attempt may take.
    pub renegotiation_timeout: Duration,
    /// Signals buffered per identity before its `peer_join` arrives.
    pub early_signal_limit: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            renegotiation_timeout: Duration::from_secs(10),
            early_signal_limit: 64,
        }
    }
}

/// Where to reach the relay and which ICE servers to gather against.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl PeerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            signaling_url: env::var("MESH_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            // Set but empty disables ICE servers (host candidates only).
            ice_servers: env::var("MESH_ICE_SERVERS")
                .map(|value| parse_list(&value))
                .unwrap_or(defaults.ice_servers),
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
