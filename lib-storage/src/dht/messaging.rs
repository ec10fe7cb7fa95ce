//! Request correlation and retransmission
//!
//! Outbound RPCs register a oneshot waiter keyed by `requestId`; inbound
//! replies resolve them. Send failures retry with exponential backoff up
//! to the configured attempt budget before the peer is reported
//! unreachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lib_mesh::MeshSession;
use lib_peer::PeerId;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::dht::wire::Frame;
use crate::errors::StorageError;

/// Pending-request table shared between the send path and the inbox.
#[derive(Debug, Default)]
pub struct RequestTracker {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a request id unique for this sender.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a waiter for the reply to `request_id`.
    pub async fn register(&self, request_id: u64) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        rx
    }

    /// Resolve a waiter with an inbound reply. Returns false when no one
    /// was waiting (late reply after timeout; dropped silently).
    pub async fn complete(&self, request_id: u64, frame: Frame) -> bool {
        match self.pending.lock().await.remove(&request_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for a request whose deadline passed.
    pub async fn forget(&self, request_id: u64) {
        self.pending.lock().await.remove(&request_id);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Send a frame, retrying with exponential backoff.
///
/// Attempt `n` sleeps `base * 2^(n-1)` before retrying. All attempts
/// exhausted maps to [`StorageError::DhtUnavailable`].
pub async fn send_with_retry(
    mesh: &MeshSession,
    peer: PeerId,
    frame: &Frame,
    attempts: u32,
    backoff_base_ms: u64,
) -> Result<(), StorageError> {
    let bytes = frame.encode();
    let mut attempt = 0u32;
    loop {
        match mesh.send(peer, bytes.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts.max(1) {
                    debug!(peer = %peer, attempts = attempt, error = %e, "send exhausted retries");
                    return Err(StorageError::DhtUnavailable(peer.to_hex()));
                }
                let delay = backoff_base_ms.saturating_mul(1u64 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// Send a request and await its reply within `timeout_ms`.
pub async fn send_and_wait(
    mesh: &MeshSession,
    tracker: &Arc<RequestTracker>,
    peer: PeerId,
    frame: Frame,
    timeout_ms: u64,
    attempts: u32,
    backoff_base_ms: u64,
) -> Result<Frame, StorageError> {
    let request_id = frame.request_id;
    let rx = tracker.register(request_id).await;

    if let Err(e) = send_with_retry(mesh, peer, &frame, attempts, backoff_base_ms).await {
        tracker.forget(request_id).await;
        return Err(e);
    }

    match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(_)) => {
            tracker.forget(request_id).await;
            Err(StorageError::DhtUnavailable(peer.to_hex()))
        }
        Err(_) => {
            tracker.forget(request_id).await;
            Err(StorageError::Timeout(timeout_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::wire::FrameBody;
    use crate::types::KeyId;

    fn ack_frame(request_id: u64) -> Frame {
        Frame {
            body: FrameBody::StoreAck {
                key_id: KeyId::for_key("k"),
            },
            request_id,
            from: PeerId::from_seed(b"a"),
            to: PeerId::from_seed(b"b"),
            ttl: 1,
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_registered_waiter() {
        let tracker = RequestTracker::new();
        let id = tracker.next_request_id();
        let rx = tracker.register(id).await;

        assert!(tracker.complete(id, ack_frame(id)).await);
        let reply = rx.await.unwrap();
        assert_eq!(reply.request_id, id);
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped() {
        let tracker = RequestTracker::new();
        assert!(!tracker.complete(99, ack_frame(99)).await);
    }

    #[tokio::test]
    async fn test_forget_clears_pending() {
        let tracker = RequestTracker::new();
        let id = tracker.next_request_id();
        let _rx = tracker.register(id).await;
        tracker.forget(id).await;
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[test]
    fn test_request_ids_are_unique_per_sender() {
        let tracker = RequestTracker::new();
        let a = tracker.next_request_id();
        let b = tracker.next_request_id();
        assert_ne!(a, b);
    }
}
