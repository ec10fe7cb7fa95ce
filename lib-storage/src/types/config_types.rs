//! Configuration type definitions
//!
//! Per-peer options recognized by the storage engine and the overlay DHT.
//! Defaults follow the deployed values; everything is overridable at
//! construction time.

use serde::{Deserialize, Serialize};

/// How concurrent updates on a key are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Highest `(version, updatedAt, owner)` wins.
    #[serde(rename = "last-write-wins")]
    LastWriteWins,
    /// Vector-clock operation log replay.
    #[serde(rename = "crdt-merge")]
    CrdtMerge,
}

/// Storage system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Maximum serialized payload size in bytes.
    pub max_value_size: usize,
    /// TTL applied to records that don't set one (milliseconds).
    pub default_ttl: Option<u64>,
    /// Seal private values with the owner keypair.
    pub encryption_enabled: bool,
    /// Feature gate for the CRDT merge path.
    #[serde(rename = "enableCRDT")]
    pub enable_crdt: bool,
    pub conflict_resolution: ConflictResolution,
    /// When false, the single-space-per-key invariant is not enforced.
    pub space_enforcement: bool,
    /// Number of replicas per key digest (K).
    pub replication_factor: usize,
    /// Hop budget for routed requests; `None` means ceil(log2 N) + 2.
    pub max_hops: Option<u8>,
    /// Deadline for one RPC round trip.
    pub rpc_timeout_ms: u64,
    /// Send retries before a peer is reported unreachable.
    pub retry_attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_backoff_ms: u64,
    /// Interval at which watched keys re-register at their replicas.
    pub subscription_republish_interval_ms: u64,
    /// How long replicas keep tombstones before purging them.
    pub tombstone_grace_ms: u64,
    /// Concurrency bound for bulk operations.
    pub bulk_fanout: usize,
    /// How long operations wait for the lazy keypair initialization.
    pub crypto_init_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_value_size: 1024 * 1024,
            default_ttl: None,
            encryption_enabled: true,
            enable_crdt: true,
            conflict_resolution: ConflictResolution::LastWriteWins,
            space_enforcement: true,
            replication_factor: 3,
            max_hops: None,
            rpc_timeout_ms: 5_000,
            retry_attempts: 3,
            retry_backoff_ms: 200,
            subscription_republish_interval_ms: 60_000,
            tombstone_grace_ms: 86_400_000,
            bulk_fanout: 32,
            crypto_init_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    /// Write quorum for `n_replicas` actually selected: ceil(K/2) + 1,
    /// capped at the number of replicas so a solo peer can still write.
    pub fn write_quorum(&self, n_replicas: usize) -> usize {
        let k = self.replication_factor;
        let q = k.div_ceil(2) + 1;
        q.min(n_replicas).max(1)
    }

    /// Hop budget for a mesh of `n_peers`.
    pub fn hop_budget(&self, n_peers: usize) -> u8 {
        if let Some(h) = self.max_hops {
            return h;
        }
        let log = (n_peers.max(1) as f64).log2().ceil() as u8;
        log.saturating_add(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.max_value_size, 1024 * 1024);
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.rpc_timeout_ms, 5_000);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.tombstone_grace_ms, 86_400_000);
        assert!(config.space_enforcement);
    }

    #[test]
    fn test_write_quorum() {
        let mut config = StorageConfig::default();
        // K=3: ceil(3/2)+1 = 3
        assert_eq!(config.write_quorum(3), 3);
        assert_eq!(config.write_quorum(2), 2);
        config.replication_factor = 1;
        // Solo peer: quorum caps at the one replica that exists.
        assert_eq!(config.write_quorum(1), 1);
        config.replication_factor = 5;
        assert_eq!(config.write_quorum(5), 4);
    }

    #[test]
    fn test_hop_budget() {
        let config = StorageConfig::default();
        assert_eq!(config.hop_budget(1), 2);
        assert_eq!(config.hop_budget(8), 5);
        let fixed = StorageConfig {
            max_hops: Some(7),
            ..StorageConfig::default()
        };
        assert_eq!(fixed.hop_budget(1000), 7);
    }

    #[test]
    fn test_conflict_resolution_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConflictResolution::LastWriteWins).unwrap(),
            "\"last-write-wins\""
        );
        assert_eq!(
            serde_json::to_string(&ConflictResolution::CrdtMerge).unwrap(),
            "\"crdt-merge\""
        );
    }
}
