use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientMessage, Identity, RegisterError, ServerMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::SignalingError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

type AckSender = oneshot::Sender<Option<RegisterError>>;

/// A registered connection to the relay.
///
/// Owns three tasks: a writer draining [`sender`](Self::sender), a reader
/// forwarding server messages to [`events`](Self::events), and a heartbeat.
/// Dropping the client (or calling [`close`](Self::close)) aborts them,
/// which closes the socket and lets the relay announce our departure.
pub struct SignalingClient {
    identity: Identity,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect, register as `identity`, and wait for the relay to accept it.
    pub async fn connect(signaling_url: &str, identity: &str) -> Result<Arc<Self>, SignalingError> {
        mesh_proto::validate_identity(identity)?;
        let url = websocket_url(signaling_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(format!("{url}: {err}")))?;
        tracing::debug!(target = "mesh", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (ack_tx, ack_rx) = oneshot::channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "mesh", error = %err, "failed to encode client message");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            let mut ack = Some(ack_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "mesh", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "mesh", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match ServerMessage::decode(&text) {
                    Ok(message) => route(message, &mut ack, &events_tx),
                    Err(err) => {
                        tracing::warn!(target = "mesh", error = %err, "unparseable server frame")
                    }
                }
            }
            tracing::debug!(target = "mesh", "signaling reader ended");
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let client = Arc::new(SignalingClient {
            identity: identity.to_string(),
            send_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        });

        client
            .send_tx
            .send(ClientMessage::Register {
                identity: identity.to_string(),
            })
            .map_err(|_| SignalingError::ChannelClosed)?;

        match tokio::time::timeout(REGISTER_TIMEOUT, ack_rx).await {
            Ok(Ok(None)) => {
                tracing::info!(target = "mesh", %identity, "registered with relay");
                Ok(client)
            }
            Ok(Ok(Some(RegisterError::AlreadyRegistered))) => {
                Err(SignalingError::AlreadyRegistered(identity.to_string()))
            }
            Ok(Ok(Some(code))) => Err(SignalingError::Rejected(format!("{code:?}"))),
            Ok(Err(_)) => Err(SignalingError::ChannelClosed),
            Err(_) => Err(SignalingError::Connect(
                "timed out waiting for register_ack".into(),
            )),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Tell the relay local setup is done and we can be paired.
    pub fn ready(&self) -> Result<(), SignalingError> {
        self.send_tx
            .send(ClientMessage::Ready)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Outbound queue for negotiate messages.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.send_tx.clone()
    }

    /// The server message stream. Can be taken once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.events_rx.lock().take()
    }

    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn route(
    message: ServerMessage,
    ack: &mut Option<AckSender>,
    events: &mpsc::UnboundedSender<ServerMessage>,
) {
    if let ServerMessage::RegisterAck { error } = &message {
        match ack.take() {
            Some(tx) => {
                let _ = tx.send(error.clone());
            }
            None => tracing::debug!(target = "mesh", "unexpected register_ack"),
        }
        return;
    }
    let _ = events.send(message);
}

/// Accept `ws(s)://` as is; map `http(s)://` to the matching websocket
/// scheme and default an empty path to `/ws`.
fn websocket_url(signaling_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(signaling_url)
        .map_err(|err| SignalingError::Connect(format!("invalid signaling url {signaling_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalingError::Connect(format!(
                "unsupported signaling scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Connect("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}
