//! Transport abstraction between peers
//!
//! The direct peer-to-peer transport gives us bidirectional ordered
//! reliable byte streams between two peer identifiers. Everything else
//! (session state, keepalive, membership events) lives in
//! [`crate::session::MeshSession`] on top of this trait.

use async_trait::async_trait;
use lib_peer::PeerId;
use serde::{Deserialize, Serialize};

use crate::MeshError;

/// Messages a transport delivers to the session that owns an endpoint.
#[derive(Debug, Clone)]
pub enum HubMsg {
    /// A remote peer completed the connection handshake with us.
    Connected(PeerId),
    /// The channel to a remote peer closed.
    Closed(PeerId),
    /// Raw payload from a remote peer (a serialized [`LinkFrame`]).
    Frame(PeerId, Vec<u8>),
}

/// Mesh-level framing on the raw byte stream.
///
/// `Data` carries opaque upper-layer frames (the DHT wire envelope);
/// ping/pong is session keepalive and never escapes the mesh layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkFrame {
    Data(Vec<u8>),
    Ping(u64),
    Pong(u64),
}

impl LinkFrame {
    pub fn encode(&self) -> Vec<u8> {
        // bincode never fails on these variants
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// The direct peer-to-peer transport collaborator.
///
/// An implementation owns the actual channels (WebRTC data channels in a
/// browser host, loopback queues in [`crate::LocalHub`]) and delivers
/// inbound traffic through the [`HubMsg`] receiver handed out at endpoint
/// registration.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Establish a channel from `from` to `to`, driving the signaling
    /// exchange underneath. Resolves once the channel is open.
    async fn connect(&self, from: PeerId, to: PeerId) -> Result<(), MeshError>;

    /// Send one payload over an established channel.
    async fn send(&self, from: PeerId, to: PeerId, payload: Vec<u8>) -> Result<(), MeshError>;

    /// Tear down the channel between `from` and `to`, if any.
    async fn close(&self, from: PeerId, to: PeerId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_frame_round_trip() {
        let frame = LinkFrame::Data(vec![1, 2, 3]);
        let decoded = LinkFrame::decode(&frame.encode()).unwrap();
        assert!(matches!(decoded, LinkFrame::Data(v) if v == vec![1, 2, 3]));

        let ping = LinkFrame::Ping(42);
        assert!(matches!(
            LinkFrame::decode(&ping.encode()),
            Some(LinkFrame::Ping(42))
        ));
    }

    #[test]
    fn test_link_frame_decode_rejects_garbage() {
        assert!(LinkFrame::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_none());
    }
}
