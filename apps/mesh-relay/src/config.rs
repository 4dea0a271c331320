use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// When set, peers are paired this long after registering instead of
    /// waiting for their `ready` message.
    pub fanout_delay: Option<Duration>,
    /// Tell the sender when a `negotiate` names an identity nobody holds.
    pub report_unknown_recipient: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

fn flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn number(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let fanout_delay = number("MESH_RELAY_FANOUT_DELAY_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Self {
            bind: env::var("MESH_RELAY_BIND").unwrap_or(defaults.bind),
            port: env::var("MESH_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            fanout_delay,
            report_unknown_recipient: flag("MESH_RELAY_REPORT_UNKNOWN_RECIPIENT")
                .unwrap_or(defaults.report_unknown_recipient),
            heartbeat_interval: number("MESH_RELAY_HEARTBEAT_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_timeout: number("MESH_RELAY_HEARTBEAT_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            fanout_delay: None,
            report_unknown_recipient: false,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}
