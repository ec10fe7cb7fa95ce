//! Vector clocks for causal ordering of collaborative writes
//!
//! Each clock records how many writes it has seen from every peer. Two
//! clocks relate in exactly one of four ways, and that relation is what
//! the merge path uses to decide whether an incoming operation is new
//! information or already-dominated history.

use lib_peer::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

/// One logical counter per writing peer.
///
/// Entries live in a sorted map so iteration and serialization are
/// deterministic across peers; a missing entry reads as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<PeerId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one write by `peer_id`. Saturates instead of wrapping so a
    /// poisoned counter can never order backwards.
    pub fn increment(&mut self, peer_id: &PeerId) {
        let counter = self.entries.entry(*peer_id).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    /// The counter recorded for a peer; zero when absent.
    pub fn get(&self, peer_id: &PeerId) -> u64 {
        self.entries.get(peer_id).copied().unwrap_or(0)
    }

    /// Pointwise maximum with another clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (peer_id, &counter) in &other.entries {
            let entry = self.entries.entry(*peer_id).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Classify the causal relation to `other` in one pass over the
    /// union of both peer sets.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut any_less = false;
        let mut any_greater = false;
        for peer_id in self.entries.keys().chain(other.entries.keys()) {
            match self.get(peer_id).cmp(&other.get(peer_id)) {
                Ordering::Less => any_less = true,
                Ordering::Greater => any_greater = true,
                Ordering::Equal => {}
            }
            if any_less && any_greater {
                return ClockOrdering::Concurrent;
            }
        }
        match (any_less, any_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    pub fn happens_after(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    pub fn concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Peers that have written under this clock.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8) -> PeerId {
        PeerId::from_bytes([id; 20])
    }

    /// Build a clock from (peer, count) pairs.
    fn clock(counts: &[(u8, u64)]) -> VectorClock {
        let mut vc = VectorClock::new();
        for &(id, n) in counts {
            for _ in 0..n {
                vc.increment(&peer(id));
            }
        }
        vc
    }

    #[test]
    fn test_counts_one_writer_at_a_time() {
        let vc = clock(&[(1, 2), (2, 1)]);
        assert_eq!(vc.get(&peer(1)), 2);
        assert_eq!(vc.get(&peer(2)), 1);
        assert_eq!(vc.get(&peer(9)), 0);
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let mut left = clock(&[(1, 3), (2, 1)]);
        let right = clock(&[(1, 1), (3, 4)]);
        left.merge(&right);

        assert_eq!(left.get(&peer(1)), 3);
        assert_eq!(left.get(&peer(2)), 1);
        assert_eq!(left.get(&peer(3)), 4);
    }

    #[test]
    fn test_compare_classifies_all_four_relations() {
        let base = clock(&[(1, 1)]);
        let extended = clock(&[(1, 1), (2, 1)]);
        let divergent = clock(&[(2, 2)]);

        assert_eq!(base.compare(&base), ClockOrdering::Equal);
        assert_eq!(base.compare(&extended), ClockOrdering::Before);
        assert_eq!(extended.compare(&base), ClockOrdering::After);
        assert_eq!(base.compare(&divergent), ClockOrdering::Concurrent);
        assert_eq!(divergent.compare(&base), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_causal_chain_orders_transitively() {
        let a = clock(&[(1, 1)]);
        let mut b = a.clone();
        b.increment(&peer(2));
        let mut c = b.clone();
        c.increment(&peer(1));

        assert!(a.happens_before(&b));
        assert!(b.happens_before(&c));
        assert!(a.happens_before(&c));
        assert!(c.happens_after(&a));
        assert!(!a.concurrent(&c));
    }

    #[test]
    fn test_unseen_writer_makes_clocks_concurrent() {
        let ours = clock(&[(1, 2)]);
        let theirs = clock(&[(1, 1), (7, 1)]);
        // They are behind on peer 1 but ahead on peer 7.
        assert!(ours.concurrent(&theirs));
    }

    #[test]
    fn test_increment_saturates() {
        let mut vc = VectorClock::new();
        vc.entries.insert(peer(1), u64::MAX);
        vc.increment(&peer(1));
        assert_eq!(vc.get(&peer(1)), u64::MAX);
    }

    #[test]
    fn test_merge_then_compare_dominates_both_inputs() {
        let left = clock(&[(1, 2)]);
        let right = clock(&[(2, 3)]);
        let mut merged = left.clone();
        merged.merge(&right);

        assert_eq!(left.compare(&merged), ClockOrdering::Before);
        assert_eq!(right.compare(&merged), ClockOrdering::Before);
        assert_eq!(merged.peer_ids(), vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_serializes_with_hex_peer_keys() {
        let vc = clock(&[(1, 1)]);
        let json = serde_json::to_value(&vc).unwrap();
        assert_eq!(json["entries"][&peer(1).to_hex()], 1);
    }
}
