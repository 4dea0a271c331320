//! Participant side of the mesh: a signaling client, one negotiated
//! session per remote identity, and the orchestrator that ties them together.

pub mod config;
pub mod error;
pub mod links;
pub mod mesh;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{MeshConfig, PeerConfig};
pub use error::{PeerError, SignalingError};
pub use links::{LinkBoard, MeshEvent, PeerLink};
pub use mesh::{LocalMedia, Mesh};
pub use session::{PeerSessionHandle, PeerState, Role};
pub use signaling::SignalingClient;
