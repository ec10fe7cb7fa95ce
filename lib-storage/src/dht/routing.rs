//! Replica selection over the live peer set
//!
//! Placement is defined entirely by XOR distance: the replicas for a key
//! digest are the K connected peers (self included) nearest to it. There
//! is no routing table to age out; the session manager's membership
//! events keep the view current.

use lib_peer::{cmp_distance, PeerId};
use std::collections::BTreeSet;

use crate::types::KeyId;

/// The local peer's view of who can hold replicas right now.
#[derive(Debug)]
pub struct ReplicaRouter {
    local: PeerId,
    /// Connected peers, excluding self.
    peers: BTreeSet<PeerId>,
}

impl ReplicaRouter {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: BTreeSet::new(),
        }
    }

    /// A peer became eligible for routing and replica duty.
    pub fn peer_up(&mut self, peer: PeerId) {
        if peer != self.local {
            self.peers.insert(peer);
        }
    }

    /// A peer's channel closed; evict it from the view.
    pub fn peer_down(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    /// Connected peers plus self.
    pub fn mesh_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn connected(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    /// The K peers nearest `key` among connected peers and self, nearest
    /// first. Ties cannot occur between distinct ids; equal ids sort
    /// stably by the lexicographic tie-break.
    pub fn replicas_for(&self, key: &KeyId, k: usize) -> Vec<PeerId> {
        let target = *key.as_bytes();
        let mut candidates: Vec<PeerId> = self.peers.iter().copied().collect();
        candidates.push(self.local);
        candidates.sort_by(|a, b| cmp_distance(a, b, &target));
        candidates.truncate(k.max(1));
        candidates
    }

    /// Is `peer` among the K nearest for `key` in this view?
    pub fn is_replica(&self, peer: &PeerId, key: &KeyId, k: usize) -> bool {
        self.replicas_for(key, k).contains(peer)
    }

    /// Nearest replica other than self, for request forwarding.
    pub fn nearest_remote_replica(&self, key: &KeyId, k: usize) -> Option<PeerId> {
        self.replicas_for(key, k)
            .into_iter()
            .find(|p| *p != self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8) -> PeerId {
        PeerId::from_bytes([id; 20])
    }

    fn router_with(local: PeerId, others: &[PeerId]) -> ReplicaRouter {
        let mut router = ReplicaRouter::new(local);
        for p in others {
            router.peer_up(*p);
        }
        router
    }

    #[test]
    fn test_self_is_always_a_candidate() {
        let local = peer(1);
        let router = ReplicaRouter::new(local);
        let key = KeyId::for_key("anything");
        assert_eq!(router.replicas_for(&key, 3), vec![local]);
        assert!(router.is_replica(&local, &key, 3));
    }

    #[test]
    fn test_replicas_are_k_nearest() {
        let local = peer(1);
        let others: Vec<PeerId> = (2..=6).map(peer).collect();
        let router = router_with(local, &others);
        let key = KeyId::for_key("placement");

        let replicas = router.replicas_for(&key, 3);
        assert_eq!(replicas.len(), 3);

        // Every selected replica is at least as close as every excluded peer.
        let target = *key.as_bytes();
        let all: Vec<PeerId> = std::iter::once(local).chain(others).collect();
        for excluded in all.iter().filter(|p| !replicas.contains(p)) {
            for selected in &replicas {
                assert_eq!(
                    lib_peer::cmp_distance(selected, excluded, &target),
                    std::cmp::Ordering::Less
                );
            }
        }
    }

    #[test]
    fn test_replica_order_is_nearest_first() {
        let local = peer(1);
        let router = router_with(local, &[peer(2), peer(3), peer(4)]);
        let key = KeyId::for_key("ordering");
        let target = *key.as_bytes();

        let replicas = router.replicas_for(&key, 4);
        for pair in replicas.windows(2) {
            assert_eq!(
                lib_peer::cmp_distance(&pair[0], &pair[1], &target),
                std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn test_peer_down_changes_view() {
        let local = peer(1);
        let mut router = router_with(local, &[peer(2), peer(3)]);
        let key = KeyId::for_key("churn");

        let before = router.replicas_for(&key, 3);
        assert_eq!(before.len(), 3);

        router.peer_down(peer(2));
        let after = router.replicas_for(&key, 3);
        assert_eq!(after.len(), 2);
        assert!(!after.contains(&peer(2)));
    }

    #[test]
    fn test_nearest_remote_replica_skips_self() {
        let local = peer(1);
        let router = router_with(local, &[peer(2)]);
        let key = KeyId::for_key("forwarding");

        let remote = router.nearest_remote_replica(&key, 2).unwrap();
        assert_eq!(remote, peer(2));

        let solo = ReplicaRouter::new(local);
        assert_eq!(solo.nearest_remote_replica(&key, 2), None);
    }

    #[test]
    fn test_all_views_agree_on_replicas() {
        // Replica selection is a pure function of the peer set, so every
        // peer with the same view computes the same list.
        let ids: Vec<PeerId> = (1..=5).map(peer).collect();
        let key = KeyId::for_key("agreement");

        let mut lists = Vec::new();
        for me in &ids {
            let others: Vec<PeerId> = ids.iter().copied().filter(|p| p != me).collect();
            let router = router_with(*me, &others);
            lists.push(router.replicas_for(&key, 3));
        }
        for list in &lists[1..] {
            assert_eq!(list, &lists[0]);
        }
    }
}
