//! Subscription registry
//!
//! Two tables: who watches the keys we replicate (inbound), and which
//! keys we watch at remote replicas (outbound). Outbound entries keep the
//! base key so subscriptions can re-register when the replica set moves.

use std::collections::{BTreeSet, HashMap};

use lib_peer::PeerId;
use tokio::sync::RwLock;

use crate::types::KeyId;

/// keyId → set of subscriber peer ids.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    inner: RwLock<HashMap<KeyId, BTreeSet<PeerId>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: KeyId, peer: PeerId) {
        self.inner.write().await.entry(key).or_default().insert(peer);
    }

    pub async fn remove(&self, key: KeyId, peer: &PeerId) {
        let mut inner = self.inner.write().await;
        if let Some(subs) = inner.get_mut(&key) {
            subs.remove(peer);
            if subs.is_empty() {
                inner.remove(&key);
            }
        }
    }

    /// Drop every subscription held by a departed peer.
    pub async fn remove_peer(&self, peer: &PeerId) {
        let mut inner = self.inner.write().await;
        inner.retain(|_, subs| {
            subs.remove(peer);
            !subs.is_empty()
        });
    }

    pub async fn subscribers(&self, key: &KeyId) -> Vec<PeerId> {
        self.inner
            .read()
            .await
            .get(key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.values().map(|s| s.len()).sum()
    }
}

/// Keys this peer watches, keyed by digest with the base key retained.
#[derive(Debug, Default)]
pub struct WatchTable {
    inner: RwLock<HashMap<KeyId, String>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: KeyId, base_key: String) {
        self.inner.write().await.insert(key, base_key);
    }

    pub async fn remove(&self, key: &KeyId) -> Option<String> {
        self.inner.write().await.remove(key)
    }

    pub async fn contains(&self, key: &KeyId) -> bool {
        self.inner.read().await.contains_key(key)
    }

    /// Snapshot of `(keyId, baseKey)` pairs for re-registration.
    pub async fn entries(&self) -> Vec<(KeyId, String)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8) -> PeerId {
        PeerId::from_bytes([id; 20])
    }

    #[tokio::test]
    async fn test_add_and_remove_subscribers() {
        let table = SubscriptionTable::new();
        let key = KeyId::for_key("watched");

        table.add(key, peer(1)).await;
        table.add(key, peer(2)).await;
        table.add(key, peer(1)).await; // idempotent

        assert_eq!(table.subscribers(&key).await, vec![peer(1), peer(2)]);
        assert_eq!(table.entry_count().await, 2);

        table.remove(key, &peer(1)).await;
        assert_eq!(table.subscribers(&key).await, vec![peer(2)]);
    }

    #[tokio::test]
    async fn test_remove_peer_sweeps_all_keys() {
        let table = SubscriptionTable::new();
        let k1 = KeyId::for_key("one");
        let k2 = KeyId::for_key("two");
        table.add(k1, peer(1)).await;
        table.add(k2, peer(1)).await;
        table.add(k2, peer(2)).await;

        table.remove_peer(&peer(1)).await;

        assert!(table.subscribers(&k1).await.is_empty());
        assert_eq!(table.subscribers(&k2).await, vec![peer(2)]);
    }

    #[tokio::test]
    async fn test_watch_table_round_trip() {
        let watches = WatchTable::new();
        let key = KeyId::for_key("doc");
        watches.add(key, "doc".into()).await;

        assert!(watches.contains(&key).await);
        assert_eq!(watches.entries().await, vec![(key, "doc".to_string())]);
        assert_eq!(watches.remove(&key).await, Some("doc".to_string()));
        assert!(watches.is_empty().await);
    }
}
