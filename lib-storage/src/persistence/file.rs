//! File-backed persistence adapter
//!
//! Keeps the whole store in memory and persists a versioned snapshot on
//! every mutation: bincode container, written to a temp file and renamed
//! so a crash mid-write never corrupts the previous snapshot. Blocking
//! I/O runs on the blocking pool.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{AdapterStats, PersistenceAdapter};

/// Current version of the snapshot format.
const SNAPSHOT_VERSION: u32 = 1;

/// Versioned container for the persisted store.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    /// Entries sorted by key for deterministic serialization.
    entries: Vec<(String, Vec<u8>, Option<String>)>,
}

/// Atomic write helper: temp file, fsync, rename (blocking I/O).
fn atomic_write_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("missing parent dir"))?;
    std::fs::create_dir_all(dir)?;

    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

/// Durable adapter backed by a single snapshot file.
#[derive(Debug)]
pub struct FileAdapter {
    path: PathBuf,
    entries: RwLock<HashMap<String, (Vec<u8>, Option<serde_json::Value>)>>,
}

impl FileAdapter {
    /// Open (or create) the store at `path`, loading any existing snapshot.
    pub async fn open(path: PathBuf) -> Result<Self> {
        // Clean up an orphaned temp file from an interrupted write.
        let tmp = path.with_extension("tmp");
        if tmp.exists() {
            if let Err(e) = std::fs::remove_file(&tmp) {
                warn!(path = ?tmp, error = %e, "failed to clean up orphaned temp file");
            } else {
                info!(path = ?tmp, "cleaned up orphaned temp file");
            }
        }

        let loaded = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
                if !path.exists() {
                    return Ok(None);
                }
                Ok(Some(std::fs::read(&path)?))
            })
            .await
            .map_err(|e| anyhow!("spawn_blocking failed: {}", e))??
        };

        let entries = match loaded {
            None => {
                info!(path = ?path, "no snapshot found, starting fresh");
                HashMap::new()
            }
            Some(bytes) => {
                let snapshot: Snapshot = bincode::deserialize(&bytes)
                    .map_err(|e| anyhow!("failed to deserialize snapshot: {}", e))?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(anyhow!(
                        "unsupported snapshot version {}, expected {}",
                        snapshot.version,
                        SNAPSHOT_VERSION
                    ));
                }
                let count = snapshot.entries.len();
                let map = snapshot
                    .entries
                    .into_iter()
                    .map(|(k, blob, meta)| {
                        let meta = meta.and_then(|m| serde_json::from_str(&m).ok());
                        (k, (blob, meta))
                    })
                    .collect();
                info!(path = ?path, entries = count, "loaded snapshot");
                map
            }
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Serialize the current state and write it out atomically.
    async fn persist(&self) -> Result<()> {
        let mut entries: Vec<(String, Vec<u8>, Option<String>)> = {
            let map = self.entries.read().await;
            map.iter()
                .map(|(k, (blob, meta))| {
                    let meta = meta.as_ref().map(|m| m.to_string());
                    (k.clone(), blob.clone(), meta)
                })
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| anyhow!("failed to serialize snapshot: {}", e))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write_sync(&path, &bytes))
            .await
            .map_err(|e| anyhow!("spawn_blocking failed: {}", e))?
            .map_err(|e| anyhow!("failed to write snapshot: {}", e))
    }
}

#[async_trait]
impl PersistenceAdapter for FileAdapter {
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
        self.persist().await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.entries.write().await.remove(key).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        self.persist().await
    }

    async fn get_stats(&self) -> Result<AdapterStats> {
        let entries = self.entries.read().await;
        Ok(AdapterStats {
            item_count: entries.len(),
            total_bytes: entries.values().map(|(b, _)| b.len() as u64).sum(),
        })
    }

    fn storage_type(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let adapter = FileAdapter::open(path.clone()).await.unwrap();
            adapter.set("alpha", vec![1, 2], None).await.unwrap();
            adapter
                .set("beta", vec![3], Some(serde_json::json!({"space": "public"})))
                .await
                .unwrap();
        }

        let reopened = FileAdapter::open(path).await.unwrap();
        assert_eq!(reopened.get("alpha").await.unwrap(), Some(vec![1, 2]));
        assert_eq!(reopened.get("beta").await.unwrap(), Some(vec![3]));
        assert_eq!(reopened.get_stats().await.unwrap().item_count, 2);
    }

    #[tokio::test]
    async fn test_delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let adapter = FileAdapter::open(path.clone()).await.unwrap();
            adapter.set("gone", vec![9], None).await.unwrap();
            assert!(adapter.delete("gone").await.unwrap());
        }

        let reopened = FileAdapter::open(path).await.unwrap();
        assert_eq!(reopened.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_orphaned_temp_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        std::fs::write(path.with_extension("tmp"), b"junk").unwrap();

        let _adapter = FileAdapter::open(path.clone()).await.unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_storage_type() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(dir.path().join("s.bin")).await.unwrap();
        assert_eq!(adapter.storage_type(), "filesystem");
    }
}
