//! Statistics and monitoring type definitions

use serde::{Deserialize, Serialize};

/// Storage engine statistics reported to callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// Whether the engine is accepting operations.
    pub enabled: bool,
    /// Records held locally (owned + replicated).
    pub item_count: usize,
    /// Serialized size of locally held values, in bytes.
    pub total_size: u64,
    /// Keys this peer owns.
    pub owned_keys: usize,
    /// Base keys this peer can resolve (owned, replicated, or cached).
    pub total_keys: usize,
    /// Keys with the CRDT merge path enabled.
    pub crdt_keys: usize,
    pub encryption_enabled: bool,
    pub max_value_size: usize,
}

/// Overlay DHT statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhtStats {
    /// Peers currently eligible for routing and replica duty.
    pub connected_peers: usize,
    /// Records in the local replica index.
    pub replica_records: usize,
    /// Keys this peer watches at remote replicas.
    pub watched_keys: usize,
    /// Remote watchers registered at this peer.
    pub subscriber_entries: usize,
    pub frames_sent: u64,
    pub frames_received: u64,
}
