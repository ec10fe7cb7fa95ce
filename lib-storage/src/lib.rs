//! Weft distributed storage
//!
//! A peer-to-peer key-value store layered on a structured overlay of
//! peers connected by direct data channels. The overlay DHT partitions
//! the 160-bit key space by XOR distance and keeps K replicas per key;
//! the storage engine on top enforces the three access regimes
//! (private / public / frozen), seals private values with the owner's
//! keypair, versions every update, and merges collaborative keys through
//! a vector-clock operation log. A lexical path interface rounds it out
//! for hierarchical data.
//!
//! Construction wires four collaborators together: a mesh session from
//! `lib-mesh`, a crypto capability from `lib-crypto`, a persistence
//! adapter, and the per-peer configuration.
//!
//! ```no_run
//! # async fn demo() -> lib_storage::Result<()> {
//! use std::sync::Arc;
//! use lib_storage::{MemoryAdapter, StorageConfig, StorageEngine, StorageSpace, StoreOptions};
//!
//! let peer = lib_peer::PeerId::random();
//! let hub = lib_mesh::LocalHub::new();
//! let mesh = hub.register(peer, Default::default()).await;
//! let engine = StorageEngine::new(
//!     peer,
//!     mesh,
//!     Arc::new(lib_crypto::SealingCrypto::new()),
//!     Arc::new(MemoryAdapter::new()),
//!     StorageConfig::default(),
//! );
//! engine.init().await?;
//! engine.start().await;
//!
//! engine
//!     .store("greeting", serde_json::json!("hi"), StoreOptions::in_space(StorageSpace::Public))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod consistency;
pub mod dht;
pub mod engine;
pub mod errors;
pub mod events;
pub mod path;
pub mod persistence;
pub mod types;

pub use consistency::{CrdtOpType, CrdtOperation, CrdtState, VectorClock};
pub use dht::{DhtNotification, Frame, FrameBody, RecordPolicy, WebDht};
pub use engine::{
    policy::{EnforcedSpacePolicy, SpacePolicy, UnenforcedSpacePolicy},
    BulkOutcome, SearchResult, SearchScope, StorageEngine, StoreOptions, UpdateOptions,
};
pub use errors::{Result, StorageError};
pub use events::{EventBus, StorageEvent};
pub use path::PathRef;
pub use persistence::{AdapterStats, FileAdapter, MemoryAdapter, PersistenceAdapter};
pub use types::{
    ConflictResolution, DhtStats, KeyId, Record, RecordMetadata, StorageConfig, StorageSpace,
    StorageStats,
};
