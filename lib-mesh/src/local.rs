//! In-process mesh hub
//!
//! A loopback implementation of [`MeshTransport`] and [`SignalingClient`]
//! backed by tokio channels. The multi-peer test suites build whole
//! topologies on one runtime with it; production hosts replace it with a
//! real data-channel transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use lib_peer::PeerId;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::session::{MeshSession, MeshSessionConfig};
use crate::signaling::{SignalingClient, SignalingMessage};
use crate::transport::{HubMsg, MeshTransport};
use crate::MeshError;

struct Endpoint {
    hub_tx: mpsc::UnboundedSender<HubMsg>,
    signaling_tx: mpsc::UnboundedSender<(PeerId, SignalingMessage)>,
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<PeerId, Endpoint>,
    links: HashSet<(PeerId, PeerId)>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Loopback mesh: every registered peer can reach every other registered
/// peer once a link is established.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<RwLock<HubInner>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and spawn its session manager.
    pub async fn register(&self, peer: PeerId, config: MeshSessionConfig) -> Arc<MeshSession> {
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let (signaling_tx, _signaling_rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.write().await;
            inner.endpoints.insert(
                peer,
                Endpoint {
                    hub_tx,
                    signaling_tx,
                },
            );
        }
        MeshSession::spawn(peer, Arc::new(self.clone()), hub_rx, config)
    }

    /// Register a peer and keep the signaling inbox, for tests that drive
    /// the rendezvous verbs directly.
    pub async fn register_with_signaling(
        &self,
        peer: PeerId,
        config: MeshSessionConfig,
    ) -> (
        Arc<MeshSession>,
        mpsc::UnboundedReceiver<(PeerId, SignalingMessage)>,
    ) {
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.write().await;
            inner.endpoints.insert(
                peer,
                Endpoint {
                    hub_tx,
                    signaling_tx,
                },
            );
        }
        let session = MeshSession::spawn(peer, Arc::new(self.clone()), hub_rx, config);
        (session, signaling_rx)
    }

    /// Drop a peer entirely: its endpoint disappears and every
    /// counterparty sees the channel close. Simulates a crashed peer.
    pub async fn kill(&self, peer: PeerId) {
        let mut inner = self.inner.write().await;
        inner.endpoints.remove(&peer);
        let affected: Vec<(PeerId, PeerId)> = inner
            .links
            .iter()
            .filter(|(a, b)| *a == peer || *b == peer)
            .copied()
            .collect();
        for key in affected {
            inner.links.remove(&key);
            let other = if key.0 == peer { key.1 } else { key.0 };
            if let Some(endpoint) = inner.endpoints.get(&other) {
                let _ = endpoint.hub_tx.send(HubMsg::Closed(peer));
            }
        }
        debug!(peer = %peer, "hub peer killed");
    }

    /// Number of registered peers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.endpoints.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.endpoints.is_empty()
    }
}

#[async_trait]
impl MeshTransport for LocalHub {
    async fn connect(&self, from: PeerId, to: PeerId) -> Result<(), MeshError> {
        let mut inner = self.inner.write().await;
        if !inner.endpoints.contains_key(&from) {
            return Err(MeshError::TransportError(format!(
                "local endpoint {} not registered",
                from
            )));
        }
        let Some(remote) = inner.endpoints.get(&to) else {
            return Err(MeshError::TransportError(format!(
                "peer {} unreachable via signaling",
                to
            )));
        };
        // Tell the callee its side of the channel is open.
        let _ = remote.hub_tx.send(HubMsg::Connected(from));
        inner.links.insert(link_key(from, to));
        Ok(())
    }

    async fn send(&self, from: PeerId, to: PeerId, payload: Vec<u8>) -> Result<(), MeshError> {
        let inner = self.inner.read().await;
        if !inner.links.contains(&link_key(from, to)) {
            return Err(MeshError::TransportError(format!(
                "no channel between {} and {}",
                from, to
            )));
        }
        let Some(remote) = inner.endpoints.get(&to) else {
            return Err(MeshError::TransportError(format!("peer {} gone", to)));
        };
        remote
            .hub_tx
            .send(HubMsg::Frame(from, payload))
            .map_err(|_| MeshError::TransportError(format!("peer {} inbox closed", to)))
    }

    async fn close(&self, from: PeerId, to: PeerId) {
        let mut inner = self.inner.write().await;
        if inner.links.remove(&link_key(from, to)) {
            if let Some(remote) = inner.endpoints.get(&to) {
                let _ = remote.hub_tx.send(HubMsg::Closed(from));
            }
        }
    }
}

#[async_trait]
impl SignalingClient for LocalHub {
    async fn send(&self, from: PeerId, message: SignalingMessage) -> Result<(), MeshError> {
        let inner = self.inner.read().await;
        let Some(endpoint) = inner.endpoints.get(&message.to()) else {
            return Err(MeshError::SignalingClosed);
        };
        endpoint
            .signaling_tx
            .send((from, message))
            .map_err(|_| MeshError::SignalingClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signaling_routes_to_destination() {
        let hub = LocalHub::new();
        let a = PeerId::from_seed(b"sig-a");
        let b = PeerId::from_seed(b"sig-b");
        let _sa = hub.register(a, MeshSessionConfig::default()).await;
        let (_sb, mut sig_b) = hub
            .register_with_signaling(b, MeshSessionConfig::default())
            .await;

        SignalingClient::send(
            &hub,
            a,
            SignalingMessage::Offer {
                to: b,
                sdp: "v=0".into(),
            },
        )
        .await
        .unwrap();

        let (from, msg) = sig_b.recv().await.unwrap();
        assert_eq!(from, a);
        assert!(matches!(msg, SignalingMessage::Offer { .. }));
    }

    #[tokio::test]
    async fn test_kill_closes_counterparty_channels() {
        let hub = LocalHub::new();
        let a = PeerId::from_seed(b"kill-a");
        let b = PeerId::from_seed(b"kill-b");
        let sa = hub.register(a, MeshSessionConfig::default()).await;
        let _sb = hub.register(b, MeshSessionConfig::default()).await;
        let mut events = sa.events().await.unwrap();

        sa.connect(b).await.unwrap();
        assert_eq!(events.recv().await, Some(crate::MeshEvent::PeerUp(b)));

        hub.kill(b).await;
        assert_eq!(events.recv().await, Some(crate::MeshEvent::PeerDown(b)));
        assert_eq!(hub.len().await, 1);
    }
}
