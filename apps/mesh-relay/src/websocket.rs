use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientMessage, ErrorKind, Identity, ServerMessage};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::registry::{HandleId, Registry, RegistryError};

/// Shared relay state handed to every connection.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<Mutex<Registry>>,
    pub config: Arc<Config>,
}

impl RelayState {
    /// Must be called inside a tokio runtime; spawns the heartbeat monitor.
    pub fn new(config: Config) -> Self {
        let state = Self {
            registry: Arc::new(Mutex::new(Registry::new())),
            config: Arc::new(config),
        };

        let monitor_state = state.clone();
        tokio::spawn(async move {
            monitor_state.monitor_heartbeats().await;
        });

        state
    }

    /// Drop connections that have not pinged within the heartbeat timeout.
    /// Dropping the registry's sender ends the writer task, which in turn
    /// closes the socket.
    async fn monitor_heartbeats(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        let timeout = self.config.heartbeat_timeout;

        loop {
            interval.tick().await;

            let mut registry = self.registry.lock();
            for handle in registry.stale(Instant::now(), timeout) {
                let identity = registry.detach(handle);
                warn!(handle, identity = ?identity, "dropping stale connection");
            }
        }
    }

    pub fn registered(&self) -> usize {
        self.registry.lock().registered()
    }

    fn reply(&self, handle: HandleId, message: ServerMessage) {
        if !self.registry.lock().send(handle, message) {
            debug!(handle, "reply dropped; connection gone");
        }
    }

    fn reply_error(
        &self,
        handle: HandleId,
        kind: ErrorKind,
        message: impl Into<String>,
        identity: Option<Identity>,
    ) {
        self.reply(
            handle,
            ServerMessage::Error {
                kind,
                message: message.into(),
                identity,
            },
        );
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: RelayState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    // The registry owns the only sender, so detaching the handle ends the writer.
    let handle = state.registry.lock().attach(tx);

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.encode() {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!(handle, "failed to encode server message: {}", err),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(handle, "writer task ended");
    });

    info!(handle, %remote_addr, "connection opened");

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = &mut writer => {
                debug!(handle, "writer finished; closing reader");
                break;
            }
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(handle, "websocket error: {}", err);
                break;
            }
            None => break,
        };

        state.registry.lock().touch(handle);

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    state.reply_error(handle, ErrorKind::BadMessage, "binary frame is not UTF-8", None);
                    continue;
                }
            },
            Message::Close(_) => {
                debug!(handle, "close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match ClientMessage::decode(&text) {
            Ok(message) => handle_client_message(&state, handle, message),
            Err(err) => {
                debug!(handle, "unparseable frame: {}", err);
                state.reply_error(
                    handle,
                    ErrorKind::BadMessage,
                    format!("invalid message format: {}", err),
                    None,
                );
            }
        }
    }

    let identity = state.registry.lock().detach(handle);
    writer.abort();
    info!(handle, identity = ?identity, %remote_addr, "connection closed");
}

pub(crate) fn handle_client_message(state: &RelayState, handle: HandleId, message: ClientMessage) {
    match message {
        ClientMessage::Register { identity } => {
            let result = state.registry.lock().register(handle, &identity);
            match result {
                Ok(()) => {
                    state.reply(handle, ServerMessage::RegisterAck { error: None });
                    if let Some(delay) = state.config.fanout_delay {
                        schedule_announce(state.clone(), handle, delay);
                    }
                }
                Err(err) => {
                    debug!(handle, %identity, "registration refused: {}", err);
                    state.reply(
                        handle,
                        ServerMessage::RegisterAck {
                            error: err.register_error(),
                        },
                    );
                }
            }
        }

        ClientMessage::Ready => {
            if state.config.fanout_delay.is_some() {
                debug!(handle, "ready ignored; fan-out is on a timer");
                return;
            }
            let result = state.registry.lock().announce(handle);
            if let Err(err) = result {
                state.reply_error(handle, ErrorKind::NotRegistered, err.to_string(), None);
            }
        }

        ClientMessage::Negotiate { recipient, payload } => {
            let result = state.registry.lock().relay(handle, &recipient, payload);
            match result {
                Ok(()) => {}
                Err(RegistryError::UnknownRecipient(name)) => {
                    debug!(handle, recipient = %name, "negotiate for unknown recipient");
                    if state.config.report_unknown_recipient {
                        state.reply_error(
                            handle,
                            ErrorKind::UnknownRecipient,
                            format!("no participant registered as `{}`", name),
                            Some(name),
                        );
                    }
                }
                Err(RegistryError::NotRegistered) => {
                    state.reply_error(
                        handle,
                        ErrorKind::NotRegistered,
                        "register before sending negotiate",
                        None,
                    );
                }
                Err(err) => warn!(handle, %recipient, "relay failed: {}", err),
            }
        }

        ClientMessage::Ping => {
            state.registry.lock().touch(handle);
            state.reply(handle, ServerMessage::Pong);
        }
    }
}

fn schedule_announce(state: RelayState, handle: HandleId, delay: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let result = state.registry.lock().announce(handle);
        if let Err(err) = result {
            debug!(handle, "delayed announce skipped: {}", err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn state_with(config: Config) -> RelayState {
        RelayState::new(config)
    }

    fn connect(state: &RelayState) -> (HandleId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.registry.lock().attach(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn register(state: &RelayState, handle: HandleId, identity: &str) {
        handle_client_message(
            state,
            handle,
            ClientMessage::Register {
                identity: identity.into(),
            },
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_acks_and_ready_pairs() {
        let state = state_with(Config::default());
        let (alice, mut alice_rx) = connect(&state);
        let (bob, mut bob_rx) = connect(&state);

        register(&state, alice, "alice");
        handle_client_message(&state, alice, ClientMessage::Ready);
        register(&state, bob, "bob");
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::RegisterAck { error: None }]
        );

        handle_client_message(&state, bob, ClientMessage::Ready);
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::PeerJoin {
                identity: "alice".into(),
                is_offerer: true
            }]
        );
        assert!(drain(&mut alice_rx).contains(&ServerMessage::PeerJoin {
            identity: "bob".into(),
            is_offerer: false
        }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_register_gets_error_ack() {
        let state = state_with(Config::default());
        let (first, _first_rx) = connect(&state);
        let (second, mut second_rx) = connect(&state);
        register(&state, first, "alice");
        register(&state, second, "alice");
        assert_eq!(
            drain(&mut second_rx),
            vec![ServerMessage::RegisterAck {
                error: Some(mesh_proto::RegisterError::AlreadyRegistered)
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_recipient_is_silent_by_default() {
        let state = state_with(Config::default());
        let (alice, mut alice_rx) = connect(&state);
        register(&state, alice, "alice");
        drain(&mut alice_rx);

        handle_client_message(
            &state,
            alice,
            ClientMessage::Negotiate {
                recipient: "carol".into(),
                payload: json!({"candidate": {"candidate": "c"}}),
            },
        );
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_recipient_reported_when_enabled() {
        let state = state_with(Config {
            report_unknown_recipient: true,
            ..Config::default()
        });
        let (alice, mut alice_rx) = connect(&state);
        register(&state, alice, "alice");
        drain(&mut alice_rx);

        handle_client_message(
            &state,
            alice,
            ClientMessage::Negotiate {
                recipient: "carol".into(),
                payload: json!({}),
            },
        );
        match drain(&mut alice_rx).as_slice() {
            [ServerMessage::Error { kind, identity, .. }] => {
                assert_eq!(*kind, ErrorKind::UnknownRecipient);
                assert_eq!(identity.as_deref(), Some("carol"));
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn negotiate_before_register_is_refused() {
        let state = state_with(Config::default());
        let (stranger, mut rx) = connect(&state);
        handle_client_message(
            &state,
            stranger,
            ClientMessage::Negotiate {
                recipient: "bob".into(),
                payload: json!({}),
            },
        );
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Error {
                kind: ErrorKind::NotRegistered,
                ..
            }]
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn ping_answers_pong() {
        let state = state_with(Config::default());
        let (handle, mut rx) = connect(&state);
        handle_client_message(&state, handle, ClientMessage::Ping);
        assert_eq!(drain(&mut rx), vec![ServerMessage::Pong]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_fanout_ignores_ready() {
        let state = state_with(Config {
            fanout_delay: Some(Duration::from_millis(500)),
            ..Config::default()
        });
        let (alice, mut alice_rx) = connect(&state);
        let (bob, mut bob_rx) = connect(&state);
        register(&state, alice, "alice");
        tokio::time::sleep(Duration::from_millis(600)).await;
        register(&state, bob, "bob");
        handle_client_message(&state, bob, ClientMessage::Ready);
        drain(&mut alice_rx);
        assert_eq!(drain(&mut bob_rx), vec![ServerMessage::RegisterAck { error: None }]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::PeerJoin {
                identity: "alice".into(),
                is_offerer: true
            }]
        );
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::PeerJoin {
                identity: "bob".into(),
                is_offerer: false
            }]
        );
    }
}
