use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientMessage, ServerMessage};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "mesh-relay")]
#[command(about = "Mesh signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a running relay, report ready, and print everything it sends
    Probe {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,

        /// Identity to register as
        #[arg(short, long, default_value = "probe")]
        identity: String,

        /// Seconds to stay connected after registering
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
}

pub async fn run_probe(url: String, identity: String, duration: u64) -> Result<()> {
    debug!("connecting to {} as {}", url, identity);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", url, e);
            return Err(anyhow!("connection failed: {}", e));
        }
        Err(_) => return Err(anyhow!("connection timeout; is the relay running?")),
    };
    let (mut write, mut read) = ws_stream.split();

    let register = ClientMessage::Register {
        identity: identity.clone(),
    };
    write.send(Message::Text(register.encode()?.into())).await?;

    let ack = timeout(Duration::from_secs(5), async {
        while let Some(frame) = read.next().await {
            if let Message::Text(text) = frame? {
                if let ServerMessage::RegisterAck { error } = ServerMessage::decode(&text)? {
                    return match error {
                        None => Ok(()),
                        Some(code) => Err(anyhow!("registration refused: {:?}", code)),
                    };
                }
            }
        }
        Err(anyhow!("relay closed before acknowledging registration"))
    })
    .await;
    match ack {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for register_ack")),
    }
    println!("registered as {}", identity);

    write
        .send(Message::Text(ClientMessage::Ready.encode()?.into()))
        .await?;

    let deadline = Instant::now() + Duration::from_secs(duration);
    let mut ping = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ping.tick() => {
                write.send(Message::Text(ClientMessage::Ping.encode()?.into())).await?;
            }
            frame = read.next() => {
                let Some(frame) = frame else {
                    println!("relay closed the connection");
                    break;
                };
                match frame? {
                    Message::Text(text) => match ServerMessage::decode(&text) {
                        Ok(ServerMessage::Pong) => debug!("pong"),
                        Ok(message) => println!("{:?}", message),
                        Err(e) => println!("unparseable frame: {} ({})", text, e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
