//! Vector-clock operation log for collaborative keys
//!
//! Records that opt in to the merge path keep a per-key log of replace
//! and merge operations. The current value is always the replay of the
//! sorted log over the folded snapshot, so any peer holding the same set
//! of operations materializes the same value regardless of arrival order.

use crate::consistency::vector_clock::VectorClock;
use lib_peer::PeerId;
use serde::{Deserialize, Serialize};

/// Operations retained per key before folding into the snapshot.
pub const MAX_OP_LOG: usize = 100;

/// How an operation combines with the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrdtOpType {
    /// Value becomes the operation payload.
    Replace,
    /// Shallow map merge when both sides are objects, replace otherwise.
    Merge,
}

/// One entry in a key's operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtOperation {
    pub peer_id: PeerId,
    /// Epoch milliseconds at the originating peer.
    pub timestamp: u64,
    /// The originator's clock after counting this operation.
    pub vector_clock: VectorClock,
    /// Operation payload.
    pub operation: serde_json::Value,
    #[serde(rename = "type")]
    pub op_type: CrdtOpType,
}

/// Per-key merge state: clock, folded snapshot, and the live log tail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtState {
    pub clock: VectorClock,
    /// Replay result of operations already folded out of the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
    #[serde(default)]
    pub log: Vec<CrdtOperation>,
}

/// Combine `current` with one operation.
fn apply_op(current: serde_json::Value, op: &CrdtOperation) -> serde_json::Value {
    match op.op_type {
        CrdtOpType::Replace => op.operation.clone(),
        CrdtOpType::Merge => match (current, &op.operation) {
            (serde_json::Value::Object(mut base), serde_json::Value::Object(incoming)) => {
                for (k, v) in incoming {
                    base.insert(k.clone(), v.clone());
                }
                serde_json::Value::Object(base)
            }
            (_, other) => other.clone(),
        },
    }
}

impl CrdtState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count and log a local write. Returns the operation for publication.
    pub fn apply_local(
        &mut self,
        self_id: PeerId,
        operation: serde_json::Value,
        op_type: CrdtOpType,
        now: u64,
    ) -> CrdtOperation {
        self.clock.increment(&self_id);
        let op = CrdtOperation {
            peer_id: self_id,
            timestamp: now,
            vector_clock: self.clock.clone(),
            operation,
            op_type,
        };
        self.insert(op.clone());
        op
    }

    /// Insert a remote operation unless the local clock already dominates
    /// the originator's position. Returns true when the log changed.
    pub fn apply_remote(&mut self, op: CrdtOperation) -> bool {
        if self.clock.get(&op.peer_id) >= op.vector_clock.get(&op.peer_id) {
            return false;
        }
        self.clock.merge(&op.vector_clock);
        self.insert(op);
        true
    }

    /// Merge another peer's full state (union of operation logs).
    pub fn merge_state(&mut self, other: &CrdtState) -> bool {
        let mut changed = false;
        for op in &other.log {
            if self.apply_remote(op.clone()) {
                changed = true;
            }
        }
        // A snapshot from a peer that has folded further than us carries
        // operations we can no longer receive individually.
        if self.snapshot.is_none() && other.snapshot.is_some() && self.log.is_empty() {
            self.snapshot = other.snapshot.clone();
            self.clock.merge(&other.clock);
            changed = true;
        }
        changed
    }

    /// Replay the sorted log over the snapshot to produce the value.
    pub fn materialize(&self) -> serde_json::Value {
        let mut value = self.snapshot.clone().unwrap_or(serde_json::Value::Null);
        for op in &self.log {
            value = apply_op(value, op);
        }
        value
    }

    /// Number of live log entries.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    fn insert(&mut self, op: CrdtOperation) {
        if self.log.contains(&op) {
            return;
        }
        self.log.push(op);
        // Sort key: timestamp asc, ties by peer id asc.
        self.log
            .sort_by(|a, b| (a.timestamp, a.peer_id).cmp(&(b.timestamp, b.peer_id)));
        self.compact();
    }

    fn compact(&mut self) {
        while self.log.len() > MAX_OP_LOG {
            let oldest = self.log.remove(0);
            let base = self.snapshot.take().unwrap_or(serde_json::Value::Null);
            self.snapshot = Some(apply_op(base, &oldest));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer(id: u8) -> PeerId {
        PeerId::from_bytes([id; 20])
    }

    #[test]
    fn test_local_ops_replay_in_order() {
        let mut state = CrdtState::new();
        let p1 = peer(1);
        state.apply_local(p1, json!({"a": 1}), CrdtOpType::Merge, 10);
        state.apply_local(p1, json!({"b": 2}), CrdtOpType::Merge, 20);

        assert_eq!(state.materialize(), json!({"a": 1, "b": 2}));
        assert_eq!(state.clock.get(&p1), 2);
    }

    #[test]
    fn test_replace_discards_previous_value() {
        let mut state = CrdtState::new();
        let p1 = peer(1);
        state.apply_local(p1, json!({"a": 1}), CrdtOpType::Merge, 10);
        state.apply_local(p1, json!("fresh"), CrdtOpType::Replace, 20);

        assert_eq!(state.materialize(), json!("fresh"));
    }

    #[test]
    fn test_merge_on_non_objects_replaces() {
        let mut state = CrdtState::new();
        let p1 = peer(1);
        state.apply_local(p1, json!(1), CrdtOpType::Merge, 10);
        state.apply_local(p1, json!({"x": 2}), CrdtOpType::Merge, 20);

        assert_eq!(state.materialize(), json!({"x": 2}));
    }

    #[test]
    fn test_convergence_under_permutation() {
        let p1 = peer(1);
        let p2 = peer(2);

        let mut origin1 = CrdtState::new();
        let op1 = origin1.apply_local(p1, json!({"x": 1}), CrdtOpType::Merge, 100);
        let mut origin2 = CrdtState::new();
        let op2 = origin2.apply_local(p2, json!({"y": 2}), CrdtOpType::Merge, 100);

        // Replica A sees op1 then op2; replica B sees op2 then op1.
        let mut a = CrdtState::new();
        a.apply_remote(op1.clone());
        a.apply_remote(op2.clone());
        let mut b = CrdtState::new();
        b.apply_remote(op2);
        b.apply_remote(op1);

        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.materialize(), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_concurrent_same_timestamp_ties_break_by_peer() {
        let p1 = peer(1);
        let p2 = peer(2);

        let mut origin1 = CrdtState::new();
        let op1 = origin1.apply_local(p1, json!({"k": "from-p1"}), CrdtOpType::Merge, 100);
        let mut origin2 = CrdtState::new();
        let op2 = origin2.apply_local(p2, json!({"k": "from-p2"}), CrdtOpType::Merge, 100);

        let mut a = CrdtState::new();
        a.apply_remote(op1.clone());
        a.apply_remote(op2.clone());
        let mut b = CrdtState::new();
        b.apply_remote(op2);
        b.apply_remote(op1);

        // p2 sorts after p1, so its write lands last on both replicas.
        assert_eq!(a.materialize(), json!({"k": "from-p2"}));
        assert_eq!(a.materialize(), b.materialize());
    }

    #[test]
    fn test_dominated_ops_are_ignored() {
        let p1 = peer(1);
        let mut origin = CrdtState::new();
        let op = origin.apply_local(p1, json!({"a": 1}), CrdtOpType::Merge, 10);

        let mut replica = CrdtState::new();
        assert!(replica.apply_remote(op.clone()));
        assert!(!replica.apply_remote(op));
        assert_eq!(replica.log_len(), 1);
    }

    #[test]
    fn test_log_folds_into_snapshot_past_cap() {
        let mut state = CrdtState::new();
        let p1 = peer(1);
        for i in 0..(MAX_OP_LOG as u64 + 10) {
            let mut fields = serde_json::Map::new();
            fields.insert(format!("k{}", i), json!(i));
            state.apply_local(p1, serde_json::Value::Object(fields), CrdtOpType::Merge, i);
        }
        assert_eq!(state.log_len(), MAX_OP_LOG);
        assert!(state.snapshot.is_some());

        let value = state.materialize();
        assert_eq!(value.get("k0"), Some(&json!(0)));
        let last = format!("k{}", MAX_OP_LOG as u64 + 9);
        assert_eq!(value.get(&last), Some(&json!(MAX_OP_LOG as u64 + 9)));
    }

    #[test]
    fn test_merge_state_unions_logs() {
        let p1 = peer(1);
        let p2 = peer(2);
        let mut s1 = CrdtState::new();
        s1.apply_local(p1, json!({"x": 1}), CrdtOpType::Merge, 50);
        let mut s2 = CrdtState::new();
        s2.apply_local(p2, json!({"y": 2}), CrdtOpType::Merge, 60);

        assert!(s1.merge_state(&s2));
        assert!(!s1.merge_state(&s2));
        assert_eq!(s1.materialize(), json!({"x": 1, "y": 2}));
    }
}
