//! Shared fixtures for the integration suites
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lib_crypto::SealingCrypto;
use lib_mesh::{LocalHub, MeshSession, MeshSessionConfig};
use lib_peer::PeerId;
use lib_storage::{MemoryAdapter, StorageConfig, StorageEngine};

pub struct TestPeer {
    pub id: PeerId,
    pub mesh: Arc<MeshSession>,
    pub engine: Arc<StorageEngine>,
    pub adapter: Arc<MemoryAdapter>,
}

/// Spin up one engine per tag on a shared in-process hub. Peers are not
/// connected yet; call [`connect_all`] for a full mesh.
pub async fn spawn_peers(hub: &LocalHub, tags: &[&str], config: &StorageConfig) -> Vec<TestPeer> {
    let mut peers = Vec::new();
    for tag in tags {
        let id = PeerId::from_seed(tag.as_bytes());
        let mesh = hub.register(id, MeshSessionConfig::default()).await;
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = StorageEngine::new(
            id,
            Arc::clone(&mesh),
            Arc::new(SealingCrypto::new()),
            Arc::clone(&adapter) as Arc<dyn lib_storage::PersistenceAdapter>,
            config.clone(),
        );
        engine.init().await.expect("engine init");
        engine.start().await;
        peers.push(TestPeer {
            id,
            mesh,
            engine,
            adapter,
        });
    }
    peers
}

/// Connect every pair of peers.
pub async fn connect_all(peers: &[TestPeer]) {
    for i in 0..peers.len() {
        for j in (i + 1)..peers.len() {
            peers[i]
                .mesh
                .connect(peers[j].id)
                .await
                .expect("mesh connect");
        }
    }
    settle(300).await;
}

/// Let in-flight frames, membership events, and the crypto init drain.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn solo_config() -> StorageConfig {
    StorageConfig {
        replication_factor: 1,
        ..StorageConfig::default()
    }
}

pub fn mesh_config() -> StorageConfig {
    StorageConfig {
        replication_factor: 3,
        retry_backoff_ms: 50,
        ..StorageConfig::default()
    }
}
