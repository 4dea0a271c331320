use std::collections::HashMap;
use std::time::{Duration, Instant};

use mesh_proto::{validate_identity, Identity, RegisterError, ServerMessage};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Process-unique id of one signaling connection.
pub type HandleId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("identity `{0}` is already registered")]
    AlreadyRegistered(Identity),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("connection is already registered as `{0}`")]
    HandleAlreadyBound(Identity),
    #[error("connection has not registered")]
    NotRegistered,
    #[error("no participant registered as `{0}`")]
    UnknownRecipient(Identity),
    #[error("connection for `{0}` is closed")]
    Undeliverable(Identity),
}

impl RegistryError {
    /// The `register_ack` error code for admission failures.
    pub fn register_error(&self) -> Option<RegisterError> {
        match self {
            RegistryError::AlreadyRegistered(_) => Some(RegisterError::AlreadyRegistered),
            RegistryError::InvalidIdentity(_) => Some(RegisterError::InvalidIdentity),
            RegistryError::HandleAlreadyBound(_) => Some(RegisterError::HandleAlreadyBound),
            _ => None,
        }
    }
}

struct Handle {
    tx: mpsc::UnboundedSender<ServerMessage>,
    identity: Option<Identity>,
    announced: bool,
    last_seen: Instant,
}

/// Identity → connection map. Every method is synchronous and the caller
/// holds the only lock, so uniqueness checks and fan-out never interleave.
#[derive(Default)]
pub struct Registry {
    handles: HashMap<HandleId, Handle>,
    identities: HashMap<Identity, HandleId>,
    next_handle: HandleId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection. It cannot relay until it registers.
    pub fn attach(&mut self, tx: mpsc::UnboundedSender<ServerMessage>) -> HandleId {
        self.next_handle += 1;
        let id = self.next_handle;
        self.handles.insert(
            id,
            Handle {
                tx,
                identity: None,
                announced: false,
                last_seen: Instant::now(),
            },
        );
        id
    }

    pub fn register(&mut self, handle: HandleId, identity: &str) -> Result<(), RegistryError> {
        let entry = self
            .handles
            .get_mut(&handle)
            .ok_or(RegistryError::NotRegistered)?;
        if let Some(bound) = &entry.identity {
            return Err(RegistryError::HandleAlreadyBound(bound.clone()));
        }
        validate_identity(identity)
            .map_err(|err| RegistryError::InvalidIdentity(err.to_string()))?;
        if self.identities.contains_key(identity) {
            return Err(RegistryError::AlreadyRegistered(identity.to_string()));
        }

        entry.identity = Some(identity.to_string());
        entry.announced = false;
        self.identities.insert(identity.to_string(), handle);
        info!(handle, %identity, "registered");
        Ok(())
    }

    /// Pair `handle` with every identity already in the mesh. The handle
    /// being announced is the newcomer and receives the offerer role for
    /// each pair. Returns the identities it was paired with.
    pub fn announce(&mut self, handle: HandleId) -> Result<Vec<Identity>, RegistryError> {
        let entry = self.handles.get(&handle).ok_or(RegistryError::NotRegistered)?;
        let joiner = entry.identity.clone().ok_or(RegistryError::NotRegistered)?;
        if entry.announced {
            debug!(handle, identity = %joiner, "already announced; ignoring");
            return Ok(Vec::new());
        }
        let joiner_tx = entry.tx.clone();

        let mut paired = Vec::new();
        for (other_id, other) in self.handles.iter() {
            if *other_id == handle || !other.announced {
                continue;
            }
            let Some(existing) = other.identity.as_ref() else {
                continue;
            };
            let _ = joiner_tx.send(ServerMessage::PeerJoin {
                identity: existing.clone(),
                is_offerer: true,
            });
            let _ = other.tx.send(ServerMessage::PeerJoin {
                identity: joiner.clone(),
                is_offerer: false,
            });
            paired.push(existing.clone());
        }

        if let Some(entry) = self.handles.get_mut(&handle) {
            entry.announced = true;
        }
        info!(handle, identity = %joiner, peers = paired.len(), "announced to mesh");
        Ok(paired)
    }

    /// Drop the identity bound to `handle` and tell every other registered
    /// participant it left. The connection itself stays attached.
    pub fn unregister(&mut self, handle: HandleId) -> Option<Identity> {
        let Some(entry) = self.handles.get_mut(&handle) else {
            debug!(handle, "unregister for unknown connection");
            return None;
        };
        let Some(identity) = entry.identity.take() else {
            debug!(handle, "unregister for connection that never registered");
            return None;
        };
        entry.announced = false;
        self.identities.remove(&identity);

        for (other_id, other) in self.handles.iter() {
            if *other_id == handle || other.identity.is_none() {
                continue;
            }
            let _ = other.tx.send(ServerMessage::PeerLeave {
                identity: identity.clone(),
            });
        }
        info!(handle, %identity, "unregistered");
        Some(identity)
    }

    /// Forget a closed connection, running the leave protocol if it was bound.
    pub fn detach(&mut self, handle: HandleId) -> Option<Identity> {
        let identity = self.unregister(handle);
        self.handles.remove(&handle);
        identity
    }

    pub fn lookup(&self, identity: &str) -> Result<HandleId, RegistryError> {
        self.identities
            .get(identity)
            .copied()
            .ok_or_else(|| RegistryError::UnknownRecipient(identity.to_string()))
    }

    pub fn identity_of(&self, handle: HandleId) -> Option<&str> {
        self.handles
            .get(&handle)
            .and_then(|entry| entry.identity.as_deref())
    }

    /// Forward `payload` untouched to `recipient`, tagged with the sender's identity.
    pub fn relay(
        &self,
        sender: HandleId,
        recipient: &str,
        payload: Value,
    ) -> Result<(), RegistryError> {
        let sender_identity = self
            .identity_of(sender)
            .ok_or(RegistryError::NotRegistered)?
            .to_string();
        let target = self.lookup(recipient)?;
        let message = ServerMessage::Negotiate {
            sender: sender_identity,
            payload,
        };
        if self.send(target, message) {
            Ok(())
        } else {
            warn!(handle = target, %recipient, "recipient channel closed");
            Err(RegistryError::Undeliverable(recipient.to_string()))
        }
    }

    pub fn send(&self, handle: HandleId, message: ServerMessage) -> bool {
        self.handles
            .get(&handle)
            .map(|entry| entry.tx.send(message).is_ok())
            .unwrap_or(false)
    }

    pub fn touch(&mut self, handle: HandleId) {
        if let Some(entry) = self.handles.get_mut(&handle) {
            entry.last_seen = Instant::now();
        }
    }

    /// Connections silent for longer than `timeout` as of `now`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<HandleId> {
        self.handles
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn registered(&self) -> usize {
        self.identities.len()
    }
}
