//! Mesh session management
//!
//! Tracks the set of currently-connected peers and their channel state,
//! runs keepalive over every open channel, and emits membership events.
//! A peer is eligible for routing and replica duty only while its state
//! is [`PeerState::Connected`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lib_peer::PeerId;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::transport::{HubMsg, LinkFrame, MeshTransport};
use crate::MeshError;

/// Per-peer channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Membership events delivered to the layers above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshEvent {
    PeerUp(PeerId),
    PeerDown(PeerId),
}

/// Session manager tunables.
#[derive(Debug, Clone)]
pub struct MeshSessionConfig {
    /// Deadline for the signaling + channel handshake.
    pub connect_timeout_ms: u64,
    /// Interval between keepalive pings per connected peer.
    pub keepalive_interval_ms: u64,
    /// A peer silent for longer than this is closed.
    pub liveness_timeout_ms: u64,
}

impl Default for MeshSessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            keepalive_interval_ms: 15_000,
            liveness_timeout_ms: 45_000,
        }
    }
}

#[derive(Debug)]
struct PeerEntry {
    state: PeerState,
    last_seen_ms: u64,
}

/// The overlay session manager.
///
/// Construct with [`MeshSession::spawn`], which wires the transport's
/// inbound queue and starts the keepalive loop.
pub struct MeshSession {
    local: PeerId,
    transport: Arc<dyn MeshTransport>,
    config: MeshSessionConfig,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    incoming_tx: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>>>,
    ping_seq: AtomicU64,
    shutdown: watch::Sender<bool>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MeshSession {
    /// Create a session over `transport` and start its background loops.
    pub fn spawn(
        local: PeerId,
        transport: Arc<dyn MeshTransport>,
        hub_rx: mpsc::UnboundedReceiver<HubMsg>,
        config: MeshSessionConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            local,
            transport,
            config,
            peers: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            ping_seq: AtomicU64::new(1),
            shutdown,
        });

        tokio::spawn(Self::inbox_loop(Arc::clone(&session), hub_rx));
        tokio::spawn(Self::keepalive_loop(Arc::clone(&session)));
        session
    }

    /// Local peer identifier.
    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    /// Establish a channel to `peer`.
    ///
    /// Drives the signaling exchange through the transport; fails with
    /// [`MeshError::TransportError`] if the handshake does not complete
    /// within the configured deadline.
    pub async fn connect(&self, peer: PeerId) -> Result<(), MeshError> {
        if self.state(peer).await == Some(PeerState::Connected) {
            return Ok(());
        }
        {
            let mut peers = self.peers.write().await;
            peers.insert(
                peer,
                PeerEntry {
                    state: PeerState::Connecting,
                    last_seen_ms: now_ms(),
                },
            );
        }

        let deadline = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let attempt = tokio::time::timeout(deadline, self.transport.connect(self.local, peer)).await;

        match attempt {
            Ok(Ok(())) => {
                self.mark_connected(peer).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.peers.write().await.remove(&peer);
                Err(e)
            }
            Err(_) => {
                self.peers.write().await.remove(&peer);
                Err(MeshError::TransportError(format!(
                    "connect to {} timed out after {} ms",
                    peer, self.config.connect_timeout_ms
                )))
            }
        }
    }

    /// Send an upper-layer frame to a connected peer.
    pub async fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<(), MeshError> {
        if self.state(peer).await != Some(PeerState::Connected) {
            return Err(MeshError::NotConnected(peer));
        }
        self.transport
            .send(self.local, peer, LinkFrame::Data(frame).encode())
            .await
    }

    /// Take the inbound frame receiver. Yields `(sender, frame)` pairs in
    /// transport arrival order. Can be taken once.
    pub async fn incoming(&self) -> Option<mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>> {
        self.incoming_rx.lock().await.take()
    }

    /// Take the membership event receiver. Can be taken once.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Snapshot of peers currently in the `Connected` state.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.state == PeerState::Connected)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Current state of a peer's channel, if known.
    pub async fn state(&self, peer: PeerId) -> Option<PeerState> {
        self.peers.read().await.get(&peer).map(|e| e.state)
    }

    /// Close the channel to `peer`.
    pub async fn disconnect(&self, peer: PeerId) {
        let was_connected = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&peer) {
                Some(entry) => {
                    let was = entry.state == PeerState::Connected;
                    entry.state = PeerState::Closing;
                    was
                }
                None => return,
            }
        };
        self.transport.close(self.local, peer).await;
        self.finish_close(peer, was_connected).await;
    }

    /// Close every channel and stop the background loops.
    pub async fn shutdown(&self) {
        let peers: Vec<PeerId> = self.peers.read().await.keys().copied().collect();
        for peer in peers {
            self.disconnect(peer).await;
        }
        let _ = self.shutdown.send(true);
    }

    async fn mark_connected(&self, peer: PeerId) {
        let newly_up = {
            let mut peers = self.peers.write().await;
            let entry = peers.entry(peer).or_insert(PeerEntry {
                state: PeerState::Connecting,
                last_seen_ms: now_ms(),
            });
            let newly = entry.state != PeerState::Connected;
            entry.state = PeerState::Connected;
            entry.last_seen_ms = now_ms();
            newly
        };
        if newly_up {
            debug!(peer = %peer, "mesh peer up");
            let _ = self.events_tx.send(MeshEvent::PeerUp(peer));
        }
    }

    async fn finish_close(&self, peer: PeerId, was_connected: bool) {
        self.peers.write().await.remove(&peer);
        if was_connected {
            debug!(peer = %peer, "mesh peer down");
            let _ = self.events_tx.send(MeshEvent::PeerDown(peer));
        }
    }

    async fn touch(&self, peer: PeerId) {
        if let Some(entry) = self.peers.write().await.get_mut(&peer) {
            entry.last_seen_ms = now_ms();
        }
    }

    async fn inbox_loop(session: Arc<Self>, mut hub_rx: mpsc::UnboundedReceiver<HubMsg>) {
        let mut shutdown = session.shutdown.subscribe();
        loop {
            tokio::select! {
                msg = hub_rx.recv() => {
                    let Some(msg) = msg else { break };
                    session.handle_hub_msg(msg).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn handle_hub_msg(&self, msg: HubMsg) {
        match msg {
            HubMsg::Connected(peer) => self.mark_connected(peer).await,
            HubMsg::Closed(peer) => {
                let was_connected = self.state(peer).await == Some(PeerState::Connected);
                self.finish_close(peer, was_connected).await;
            }
            HubMsg::Frame(from, bytes) => {
                self.touch(from).await;
                match LinkFrame::decode(&bytes) {
                    Some(LinkFrame::Data(payload)) => {
                        let _ = self.incoming_tx.send((from, payload));
                    }
                    Some(LinkFrame::Ping(seq)) => {
                        let pong = LinkFrame::Pong(seq).encode();
                        if let Err(e) = self.transport.send(self.local, from, pong).await {
                            warn!(peer = %from, error = %e, "pong send failed");
                        }
                    }
                    Some(LinkFrame::Pong(_)) => {
                        // touch() above already refreshed liveness
                    }
                    None => {
                        warn!(peer = %from, len = bytes.len(), "dropping undecodable mesh frame");
                    }
                }
            }
        }
    }

    async fn keepalive_loop(session: Arc<Self>) {
        let mut shutdown = session.shutdown.subscribe();
        let interval = std::time::Duration::from_millis(session.config.keepalive_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }

            let now = now_ms();
            let mut stale = Vec::new();
            let mut live = Vec::new();
            {
                let peers = session.peers.read().await;
                for (peer, entry) in peers.iter() {
                    if entry.state != PeerState::Connected {
                        continue;
                    }
                    if now.saturating_sub(entry.last_seen_ms) > session.config.liveness_timeout_ms {
                        stale.push(*peer);
                    } else {
                        live.push(*peer);
                    }
                }
            }

            for peer in stale {
                warn!(peer = %peer, "mesh peer missed liveness deadline, closing");
                session.disconnect(peer).await;
            }

            for peer in live {
                let seq = session.ping_seq.fetch_add(1, Ordering::Relaxed);
                let ping = LinkFrame::Ping(seq).encode();
                if let Err(e) = session.transport.send(session.local, peer, ping).await {
                    warn!(peer = %peer, error = %e, "keepalive ping failed, closing");
                    session.disconnect(peer).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalHub;

    fn peer(tag: &[u8]) -> PeerId {
        PeerId::from_seed(tag)
    }

    #[tokio::test]
    async fn test_connect_marks_both_sides_connected() {
        let hub = LocalHub::new();
        let a = peer(b"session-a");
        let b = peer(b"session-b");
        let sa = hub.register(a, MeshSessionConfig::default()).await;
        let sb = hub.register(b, MeshSessionConfig::default()).await;

        sa.connect(b).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(sa.state(b).await, Some(PeerState::Connected));
        // Give the remote inbox a moment to process the Connected notice.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sb.state(a).await, Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let hub = LocalHub::new();
        let a = peer(b"lonely-a");
        let b = peer(b"lonely-b");
        let sa = hub.register(a, MeshSessionConfig::default()).await;

        let err = sa.send(b, vec![1]).await.unwrap_err();
        assert!(matches!(err, MeshError::NotConnected(p) if p == b));
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let hub = LocalHub::new();
        let a = peer(b"order-a");
        let b = peer(b"order-b");
        let sa = hub.register(a, MeshSessionConfig::default()).await;
        let sb = hub.register(b, MeshSessionConfig::default()).await;
        let mut inbox = sb.incoming().await.unwrap();

        sa.connect(b).await.unwrap();
        for i in 0u8..5 {
            sa.send(b, vec![i]).await.unwrap();
        }

        for i in 0u8..5 {
            let (from, frame) = inbox.recv().await.unwrap();
            assert_eq!(from, a);
            assert_eq!(frame, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_disconnect_emits_peer_down() {
        let hub = LocalHub::new();
        let a = peer(b"down-a");
        let b = peer(b"down-b");
        let sa = hub.register(a, MeshSessionConfig::default()).await;
        let _sb = hub.register(b, MeshSessionConfig::default()).await;
        let mut events = sa.events().await.unwrap();

        sa.connect(b).await.unwrap();
        assert_eq!(events.recv().await, Some(MeshEvent::PeerUp(b)));

        sa.disconnect(b).await;
        assert_eq!(events.recv().await, Some(MeshEvent::PeerDown(b)));
        assert_eq!(sa.state(b).await, None);
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer_fails() {
        let hub = LocalHub::new();
        let a = peer(b"known-a");
        let ghost = peer(b"ghost");
        let sa = hub.register(a, MeshSessionConfig::default()).await;

        assert!(matches!(
            sa.connect(ghost).await,
            Err(MeshError::TransportError(_))
        ));
        assert_eq!(sa.state(ghost).await, None);
    }
}
