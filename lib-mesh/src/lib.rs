//! Weft overlay session manager
//!
//! The mesh layer answers one question for the layers above it: who is
//! reachable right now, and how do I hand them bytes. It brokers initial
//! connections through the external signaling collaborator, tracks per-peer
//! channel state, runs keepalive, and surfaces membership events that drive
//! replica maintenance in the storage layer.
//!
//! The actual peer-to-peer transport (WebRTC data channels or otherwise)
//! is a collaborator behind [`MeshTransport`]; this crate ships
//! [`LocalHub`], an in-process implementation used by the test suites.

pub mod local;
pub mod session;
pub mod signaling;
pub mod transport;

pub use local::LocalHub;
pub use session::{MeshEvent, MeshSession, MeshSessionConfig, PeerState};
pub use signaling::{SignalingClient, SignalingMessage};
pub use transport::{HubMsg, MeshTransport};

/// Errors surfaced at the mesh boundary.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("transport error: {0}")]
    TransportError(String),

    #[error("not connected to peer {0}")]
    NotConnected(lib_peer::PeerId),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("signaling channel closed")]
    SignalingClosed,
}
