//! In-memory persistence adapter

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AdapterStats, PersistenceAdapter};

/// Volatile adapter backed by a map. Used by tests and by hosts that
/// explicitly opt out of durability.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    entries: RwLock<HashMap<String, (Vec<u8>, Option<serde_json::Value>)>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).map(|(b, _)| b.clone()))
    }

    async fn set(
        &self,
        key: &str,
        blob: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (blob, metadata));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn get_stats(&self) -> Result<AdapterStats> {
        let entries = self.entries.read().await;
        Ok(AdapterStats {
            item_count: entries.len(),
            total_bytes: entries.values().map(|(b, _)| b.len() as u64).sum(),
        })
    }

    fn storage_type(&self) -> &'static str {
        "memory"
    }
}
