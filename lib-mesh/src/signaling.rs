//! Signaling collaborator interface
//!
//! Before two peers hold a direct channel they exchange session
//! descriptions and ICE candidates through a rendezvous broker. The broker
//! itself is external; the mesh only needs the three verbs below. No
//! storage traffic ever flows over signaling.

use async_trait::async_trait;
use lib_peer::PeerId;
use serde::{Deserialize, Serialize};

use crate::MeshError;

/// The three signaling verbs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "UPPERCASE")]
pub enum SignalingMessage {
    Offer { to: PeerId, sdp: String },
    Answer { to: PeerId, sdp: String },
    Ice { to: PeerId, candidate: String },
}

impl SignalingMessage {
    /// Destination peer of this message.
    pub fn to(&self) -> PeerId {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::Ice { to, .. } => *to,
        }
    }
}

/// Duplex handle onto the rendezvous broker.
///
/// Implementations deliver inbound messages through the receiver handed to
/// the transport at construction; this trait only covers the outbound half.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Relay a signaling message to its destination peer.
    async fn send(&self, from: PeerId, message: SignalingMessage) -> Result<(), MeshError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_message_is_verb_tagged() {
        let to = PeerId::from_seed(b"dest");
        let msg = SignalingMessage::Offer {
            to,
            sdp: "v=0".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["verb"], "OFFER");
        assert_eq!(json["to"], to.to_hex());
        let back: SignalingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_destination_accessor() {
        let to = PeerId::from_seed(b"ice-dest");
        let msg = SignalingMessage::Ice {
            to,
            candidate: "candidate:0".into(),
        };
        assert_eq!(msg.to(), to);
    }
}
