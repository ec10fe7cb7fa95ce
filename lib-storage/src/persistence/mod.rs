//! Local persistence adapter
//!
//! The adapter is the only durable state a peer has; every in-memory
//! table is reconstructible from it plus the overlay. Blobs are opaque
//! to the adapter. Hosts pick the implementation: in-memory for tests,
//! file-backed for native peers, an IndexedDB bridge in browsers.

pub mod file;
pub mod memory;

pub use file::FileAdapter;
pub use memory::MemoryAdapter;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Counters every adapter reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStats {
    pub item_count: usize,
    pub total_bytes: u64,
}

/// Durable key→blob store contract.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob with optional adapter-opaque metadata.
    async fn set(&self, key: &str, blob: Vec<u8>, metadata: Option<serde_json::Value>)
        -> Result<()>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;

    async fn get_stats(&self) -> Result<AdapterStats>;

    /// One of `"memory"`, `"filesystem"`, `"indexeddb"`.
    fn storage_type(&self) -> &'static str;
}
