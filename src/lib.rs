//! Full-mesh WebRTC conferencing: a WebSocket signaling relay that tracks
//! room membership, and a client that keeps one peer connection per remote
//! participant.

#[cfg(feature = "capture")]
pub mod audio;
pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod protocol;
pub mod relay;
pub mod signaling;

pub use config::{MeshConfig, RelayConfig};
pub use error::{Error, Result};
pub use media::{LocalMediaSession, MediaConstraints, MediaDevices, SyntheticDevices};
pub use mesh::{PeerMeshOrchestrator, RoomSession};
pub use protocol::{ClientEvent, EventKind, PeerId, RoomId, ServerEvent};
pub use relay::{RelayServer, RoomRegistry, SignalingRelay};
pub use signaling::NegotiationChannel;
