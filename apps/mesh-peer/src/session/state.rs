use std::fmt;

/// Lifecycle of the link to one remote identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Idle,
    Negotiating,
    Connected,
    /// Renegotiating a live link. Previously surfaced media keeps flowing.
    Renegotiating,
    Failed,
    Closed,
}

impl PeerState {
    /// Whether media from this peer can currently be played.
    pub fn is_live(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Renegotiating)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Idle => "idle",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Renegotiating => "renegotiating",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of a pair writes the first offer. Assigned by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    pub fn from_is_offerer(is_offerer: bool) -> Self {
        if is_offerer {
            Role::Offerer
        } else {
            Role::Answerer
        }
    }
}
