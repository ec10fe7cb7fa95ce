//! Storage engine
//!
//! The contract exposed to applications: storage spaces, per-owner
//! encryption, access control, optimistic versioning, and the CRDT merge
//! path, all layered on the overlay DHT. Local-policy failures happen
//! before any network effect; network failures never undo committed
//! local state.

pub mod policy;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use lib_crypto::{Crypto, Keypair, PublicKey, SealedEnvelope};
use lib_mesh::MeshSession;
use lib_peer::PeerId;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::consistency::{CrdtOpType, CrdtState};
use crate::dht::{DhtNotification, WebDht};
use crate::errors::{Result, StorageError};
use crate::events::{EventBus, StorageEvent};
use crate::persistence::PersistenceAdapter;
use crate::types::{
    now_ms, DhtStats, Record, RecordMetadata, StorageConfig, StorageSpace, StorageStats,
};

use policy::{space_policy, EngineRecordPolicy, SpacePolicy};

/// Namespace for the per-peer encryption key directory.
const PUBKEY_PREFIX: &str = "~pubkey:";

/// System records (the key directory) are excluded from user-facing
/// listings and statistics.
fn is_internal_key(base_key: &str) -> bool {
    base_key.starts_with('~')
}

/// Options accepted by [`StorageEngine::store`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub space: Option<StorageSpace>,
    /// Legacy flags honored when `space` is unset.
    pub is_public: Option<bool>,
    pub is_immutable: Option<bool>,
    /// Expiry in milliseconds after the last update.
    pub ttl: Option<u64>,
    pub enable_crdt: bool,
    pub allowed_peers: Vec<PeerId>,
}

impl StoreOptions {
    pub fn in_space(space: StorageSpace) -> Self {
        Self {
            space: Some(space),
            ..Self::default()
        }
    }

    fn resolve_space(&self) -> StorageSpace {
        match self.space {
            Some(space) => space,
            None => StorageSpace::from_legacy_flags(
                self.is_public.unwrap_or(false),
                self.is_immutable.unwrap_or(false),
            ),
        }
    }
}

/// Options accepted by [`StorageEngine::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Let a non-owner merge into a CRDT-enabled record.
    pub force_crdt_merge: bool,
}

/// Partial-failure aggregation for bulk operations.
#[derive(Debug, Default)]
pub struct BulkOutcome<T> {
    pub ok: Vec<(String, T)>,
    pub failed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

impl<T> BulkOutcome<T> {
    fn absorb(&mut self, key: String, result: Result<T>) {
        match result {
            Ok(value) => self.ok.push((key, value)),
            Err(e) => {
                self.errors.push((key.clone(), e.to_string()));
                self.failed.push(key);
            }
        }
    }
}

/// Which record fields a search query matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Key,
    Value,
    Metadata,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub key: String,
    pub space: StorageSpace,
    pub owner: PeerId,
}

/// Lazily-initialized crypto capability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CryptoStatus {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct SpaceEntry {
    space: StorageSpace,
    owner: PeerId,
}

/// The distributed storage engine for one peer.
pub struct StorageEngine {
    local: PeerId,
    config: StorageConfig,
    dht: Arc<WebDht>,
    crypto: Arc<dyn Crypto>,
    keypair: RwLock<Option<Keypair>>,
    crypto_status: watch::Sender<CryptoStatus>,
    persistence: Arc<dyn PersistenceAdapter>,
    enabled: AtomicBool,
    /// Flips off when keypair initialization times out or fails.
    encryption_active: AtomicBool,
    /// Explicit base key → (space, owner) resolution, built from local
    /// persistence at startup and maintained on every write/retrieve.
    space_index: RwLock<HashMap<String, SpaceEntry>>,
    owned_keys: RwLock<BTreeSet<String>>,
    cache: RwLock<HashMap<String, Record>>,
    crdt_states: RwLock<HashMap<String, CrdtState>>,
    /// Per-key in-flight queue: writes on one base key serialize in
    /// issue order.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    space_policy: Arc<dyn SpacePolicy>,
    events: EventBus,
}

impl StorageEngine {
    /// Wire up an engine over a mesh session. Call [`Self::init`] and
    /// [`Self::start`] before use.
    pub fn new(
        local: PeerId,
        mesh: Arc<MeshSession>,
        crypto: Arc<dyn Crypto>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: StorageConfig,
    ) -> Arc<Self> {
        let record_policy = Arc::new(EngineRecordPolicy::new(config.space_enforcement));
        let dht = WebDht::new(local, mesh, config.clone(), record_policy);
        let (crypto_status, _) = watch::channel(CryptoStatus::Pending);
        Arc::new(Self {
            local,
            space_policy: space_policy(config.space_enforcement),
            encryption_active: AtomicBool::new(config.encryption_enabled),
            config,
            dht,
            crypto,
            keypair: RwLock::new(None),
            crypto_status,
            persistence,
            enabled: AtomicBool::new(true),
            space_index: RwLock::new(HashMap::new()),
            owned_keys: RwLock::new(BTreeSet::new()),
            cache: RwLock::new(HashMap::new()),
            crdt_states: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            events: EventBus::default(),
        })
    }

    /// Rebuild the in-memory tables from the persistence adapter.
    pub async fn init(&self) -> Result<()> {
        let keys = self.persistence.keys().await?;
        let mut restored = 0usize;
        for key in keys {
            let Some(bytes) = self.persistence.get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_slice::<Record>(&bytes) else {
                warn!(key, "skipping undecodable persisted record");
                continue;
            };
            self.index_record(&key, &record).await;
            self.cache.write().await.insert(key.clone(), record);
            restored += 1;
        }
        if restored > 0 {
            info!(records = restored, "restored local records from persistence");
        }
        Ok(())
    }

    /// Start the overlay loops, the crypto initialization, and the
    /// notification consumer.
    pub async fn start(self: &Arc<Self>) {
        self.dht.start().await;

        // Lazy keypair initialization; operations gate on the watch.
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.crypto.generate_random_pair() {
                Ok(pair) => {
                    *engine.keypair.write().await = Some(pair);
                    let _ = engine.crypto_status.send(CryptoStatus::Ready);
                    if let Err(e) = engine.publish_own_pubkey().await {
                        debug!(error = %e, "public key announcement deferred");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "keypair generation failed, disabling encryption");
                    engine.encryption_active.store(false, Ordering::Relaxed);
                    let _ = engine.crypto_status.send(CryptoStatus::Failed);
                }
            }
        });

        if let Some(rx) = self.dht.notifications().await {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.consume_notifications(rx).await;
            });
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    pub fn dht(&self) -> &Arc<WebDht> {
        &self.dht
    }

    /// Subscribe to the typed event stream.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        self.events.emit(StorageEvent::StorageEnabled);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.events.emit(StorageEvent::StorageDisabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Drop every locally held record and wipe the adapter.
    pub async fn clear(&self) -> Result<()> {
        self.cache.write().await.clear();
        self.owned_keys.write().await.clear();
        self.space_index.write().await.clear();
        self.crdt_states.write().await.clear();
        self.dht.clear_local().await;
        self.persistence.clear().await?;
        self.events.emit(StorageEvent::StorageCleared);
        Ok(())
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(StorageError::Disabled)
        }
    }

    /// Emit a per-key event unless the key is a system record.
    fn emit_key_event(&self, base_key: &str, event: StorageEvent) {
        if !is_internal_key(base_key) {
            self.events.emit(event);
        }
    }

    // ------------------------------------------------------------------
    // store
    // ------------------------------------------------------------------

    /// Publish a new record under `base_key`.
    pub async fn store(
        &self,
        base_key: &str,
        value: serde_json::Value,
        options: StoreOptions,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let _guard = self.key_lock(base_key).await;

        let space = options.resolve_space();
        let serialized = serde_json::to_vec(&value)
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("unserializable value: {}", e)))?;
        if serialized.len() > self.config.max_value_size {
            return Err(StorageError::ValueTooLarge {
                size: serialized.len(),
                max: self.config.max_value_size,
            });
        }

        // Space invariant: check what we know locally, then look up.
        let known = self.resolve_space_entry(base_key).await;
        self.space_policy
            .check_store(base_key, space, known.map(|e| e.space))?;
        if let Some(entry) = known {
            if entry.owner != self.local {
                return Err(StorageError::AccessDenied(base_key.to_string()));
            }
        }

        let previous = self.load_local(base_key).await;
        let now = now_ms();
        let mut metadata = RecordMetadata::new(base_key.to_string(), space, self.local, now);
        metadata.ttl = options.ttl.or(self.config.default_ttl);
        // Peers configured for crdt-merge resolution enable the merge
        // path on every record they create.
        let wants_crdt = options.enable_crdt
            || self.config.conflict_resolution == crate::types::ConflictResolution::CrdtMerge;
        metadata.enable_crdt = wants_crdt && self.config.enable_crdt;
        metadata.allowed_peers = options.allowed_peers.iter().copied().collect();
        if let Some(prev) = &previous {
            // Re-store by the owner acts as a versioned overwrite.
            metadata.created_at = prev.metadata.created_at;
            metadata.version = prev.metadata.version + 1;
        }

        let mut record = Record::new(value.clone(), metadata);
        if space == StorageSpace::Private && self.encryption_ready().await {
            match self.seal_value(&serialized, &record.metadata.allowed_peers).await {
                Ok(sealed) => {
                    record.value = sealed;
                    record.encrypted = true;
                    record.encrypted_by = Some(self.local);
                }
                Err(e) => {
                    warn!(key = base_key, error = %e, "sealing failed, storing unencrypted");
                }
            }
        }
        if record.metadata.enable_crdt {
            let mut state = CrdtState::new();
            state.apply_local(self.local, value, CrdtOpType::Replace, now);
            self.crdt_states
                .write()
                .await
                .insert(base_key.to_string(), state.clone());
            record.crdt = Some(state);
        }

        self.commit_local(base_key, &record).await?;

        match self.dht.put(base_key, record.clone()).await {
            Ok(()) => {
                self.emit_key_event(
                    base_key,
                    StorageEvent::DataStored {
                        key: base_key.to_string(),
                        space,
                    },
                );
                Ok(())
            }
            Err(e @ StorageError::QuorumFailed { .. }) => {
                // Local copy is retained; propagation resumes when peers
                // return.
                self.emit_key_event(
                    base_key,
                    StorageEvent::DataStored {
                        key: base_key.to_string(),
                        space,
                    },
                );
                Err(e)
            }
            Err(e) => {
                self.rollback_local(base_key, previous).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // retrieve
    // ------------------------------------------------------------------

    /// Fetch and decode the value stored under `base_key`. Inaccessible
    /// and unknown keys are indistinguishable: both return `None`.
    pub async fn retrieve(
        &self,
        base_key: &str,
        force_refresh: bool,
    ) -> Result<Option<serde_json::Value>> {
        self.ensure_enabled()?;

        let mut record = if force_refresh {
            None
        } else {
            self.load_local(base_key).await
        };
        if record.is_none() {
            record = self.dht.get(base_key, force_refresh).await?;
        }
        let Some(record) = record else {
            return Ok(None);
        };

        if record.is_tombstone() || record.is_expired(now_ms()) {
            return Ok(None);
        }
        if record.validate_wire().is_err() {
            return Ok(None);
        }
        // Space consistency against the local resolution index.
        if let Some(entry) = self.space_index.read().await.get(base_key) {
            if entry.space != record.metadata.space {
                warn!(key = base_key, "record space disagrees with local index");
                return Ok(None);
            }
        }
        if !record.metadata.can_read(&self.local) {
            return Ok(None);
        }

        let value = self.open_value(&record).await;
        if value.is_none() && record.metadata.space == StorageSpace::Private {
            return Ok(None);
        }

        // Update caches and the key → space resolution map.
        self.index_record(base_key, &record).await;
        if let Some(state) = &record.crdt {
            let mut states = self.crdt_states.write().await;
            states
                .entry(base_key.to_string())
                .or_default()
                .merge_state(state);
        }
        self.cache
            .write()
            .await
            .insert(base_key.to_string(), record.clone());
        if let Ok(bytes) = serde_json::to_vec(&record) {
            let _ = self.persistence.set(base_key, bytes, None).await;
        }

        self.emit_key_event(
            base_key,
            StorageEvent::DataRetrieved {
                key: base_key.to_string(),
            },
        );
        Ok(value.or(Some(record.value)))
    }

    // ------------------------------------------------------------------
    // update
    // ------------------------------------------------------------------

    /// Mutate the record under `base_key`.
    pub async fn update(
        &self,
        base_key: &str,
        new_value: serde_json::Value,
        options: UpdateOptions,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let _guard = self.key_lock(base_key).await;

        let serialized_len = serde_json::to_vec(&new_value)
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("unserializable value: {}", e)))?
            .len();
        if serialized_len > self.config.max_value_size {
            return Err(StorageError::ValueTooLarge {
                size: serialized_len,
                max: self.config.max_value_size,
            });
        }

        // Load access control state, fetching once if unknown.
        let mut current = self.load_local(base_key).await;
        if current.is_none() {
            current = self.dht.get(base_key, false).await.unwrap_or(None);
        }
        let Some(current) = current else {
            return Err(StorageError::NotFound(base_key.to_string()));
        };
        if current.is_tombstone() {
            return Err(StorageError::NotFound(base_key.to_string()));
        }

        // Frozen content never changes after the first write, for the
        // owner, for CRDT mergers, for anyone. Only the ACL path mutates
        // frozen records.
        if current.metadata.space == StorageSpace::Frozen && new_value != current.value {
            return Err(StorageError::AccessDenied(base_key.to_string()));
        }

        let is_owner = current.metadata.owner == self.local;
        if !is_owner && !(current.metadata.enable_crdt && options.force_crdt_merge) {
            return Err(StorageError::AccessDenied(base_key.to_string()));
        }

        if current.metadata.enable_crdt {
            self.crdt_update(base_key, current, new_value).await
        } else {
            self.owner_update(base_key, current, new_value).await
        }
    }

    /// Plain owner update: bump the version, reseal if private, publish.
    async fn owner_update(
        &self,
        base_key: &str,
        current: Record,
        new_value: serde_json::Value,
    ) -> Result<()> {
        let now = now_ms();
        let mut record = current.clone();
        record.metadata.version += 1;
        record.metadata.updated_at = now;
        record.encrypted = false;
        record.encrypted_by = None;
        record.value = new_value.clone();

        if record.metadata.space == StorageSpace::Private && self.encryption_ready().await {
            let serialized = serde_json::to_vec(&new_value)
                .map_err(|e| StorageError::Internal(anyhow::anyhow!("{}", e)))?;
            match self
                .seal_value(&serialized, &record.metadata.allowed_peers)
                .await
            {
                Ok(sealed) => {
                    record.value = sealed;
                    record.encrypted = true;
                    record.encrypted_by = Some(self.local);
                }
                Err(e) => {
                    warn!(key = base_key, error = %e, "resealing failed, updating unencrypted");
                }
            }
        }

        self.commit_local(base_key, &record).await?;
        let publish = self.dht.update(base_key, record.clone()).await;

        self.emit_key_event(
            base_key,
            StorageEvent::DataUpdated {
                key: base_key.to_string(),
                value: new_value,
                version: record.metadata.version,
            },
        );

        match publish {
            Ok(()) | Err(StorageError::QuorumFailed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// CRDT path: count the operation locally, replay the log, publish
    /// the materialized value with exactly one version bump.
    async fn crdt_update(
        &self,
        base_key: &str,
        current: Record,
        new_value: serde_json::Value,
    ) -> Result<()> {
        if current.encrypted && current.metadata.owner != self.local {
            // A non-owner cannot reseal for the ACL, so encrypted records
            // only merge through their owner.
            return Err(StorageError::AccessDenied(base_key.to_string()));
        }

        let now = now_ms();
        let op_type = if new_value.is_object() {
            CrdtOpType::Merge
        } else {
            CrdtOpType::Replace
        };

        let state = {
            let mut states = self.crdt_states.write().await;
            let state = states.entry(base_key.to_string()).or_default();
            if let Some(remote) = &current.crdt {
                state.merge_state(remote);
            }
            state.apply_local(self.local, new_value, op_type, now);
            state.clone()
        };

        let mut record = current;
        record.value = state.materialize();
        record.crdt = Some(state);
        // Merged values are plaintext replays of the operation log.
        record.encrypted = false;
        record.encrypted_by = None;
        record.metadata.version += 1;
        record.metadata.updated_at = now;

        self.commit_local(base_key, &record).await?;
        let publish = self.dht.update(base_key, record.clone()).await;

        self.emit_key_event(
            base_key,
            StorageEvent::DataUpdated {
                key: base_key.to_string(),
                value: record.value.clone(),
                version: record.metadata.version,
            },
        );

        match publish {
            Ok(()) | Err(StorageError::QuorumFailed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    /// Replace the record with a tombstone and clear local state.
    /// Owner only; idempotent.
    pub async fn delete(&self, base_key: &str) -> Result<()> {
        self.ensure_enabled()?;
        let _guard = self.key_lock(base_key).await;

        let known = self.resolve_space_entry(base_key).await;
        match known {
            Some(entry) if entry.owner != self.local => {
                return Err(StorageError::AccessDenied(base_key.to_string()));
            }
            None => return Err(StorageError::NotFound(base_key.to_string())),
            _ => {}
        }

        let current = match self.load_local(base_key).await {
            Some(record) => Some(record),
            None => self.dht.get(base_key, false).await.unwrap_or(None),
        };
        let Some(current) = current else {
            // Nothing left anywhere: a repeat delete, which succeeds.
            return Ok(());
        };
        if current.is_tombstone() {
            return Ok(());
        }

        let tombstone = current.tombstone(self.local, now_ms());
        let publish = self.dht.update(base_key, tombstone).await;

        self.cache.write().await.remove(base_key);
        self.owned_keys.write().await.remove(base_key);
        self.crdt_states.write().await.remove(base_key);
        let _ = self.persistence.delete(base_key).await;
        // The space index keeps the entry: the key's space and ownership
        // outlive its value.

        self.emit_key_event(
            base_key,
            StorageEvent::DataDeleted {
                key: base_key.to_string(),
                deleted_by: Some(self.local),
            },
        );

        match publish {
            Ok(()) | Err(StorageError::QuorumFailed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Access control
    // ------------------------------------------------------------------

    pub async fn grant_access(&self, base_key: &str, peer: PeerId) -> Result<()> {
        self.change_access(base_key, peer, true).await
    }

    pub async fn revoke_access(&self, base_key: &str, peer: PeerId) -> Result<()> {
        self.change_access(base_key, peer, false).await
    }

    async fn change_access(&self, base_key: &str, peer: PeerId, grant: bool) -> Result<()> {
        self.ensure_enabled()?;
        let _guard = self.key_lock(base_key).await;

        let mut current = self.load_local(base_key).await;
        if current.is_none() {
            current = self.dht.get(base_key, false).await.unwrap_or(None);
        }
        let Some(current) = current else {
            return Err(StorageError::NotFound(base_key.to_string()));
        };
        if current.metadata.owner != self.local {
            return Err(StorageError::AccessDenied(base_key.to_string()));
        }
        if current.metadata.space == StorageSpace::Public {
            // Everyone can already read public records.
            return Err(StorageError::AccessDenied(base_key.to_string()));
        }

        let previous = current.clone();
        let mut record = current;
        let changed = if grant {
            record.metadata.allowed_peers.insert(peer)
        } else {
            record.metadata.allowed_peers.remove(&peer)
        };
        if !changed {
            return Ok(());
        }
        record.metadata.version += 1;
        record.metadata.updated_at = now_ms();

        // Private values are resealed so the new reader set (and only it)
        // can open them.
        if record.encrypted {
            let plaintext = self
                .open_value(&previous)
                .await
                .ok_or(StorageError::CryptoUnavailable)?;
            let serialized = serde_json::to_vec(&plaintext)
                .map_err(|e| StorageError::Internal(anyhow::anyhow!("{}", e)))?;
            record.value = self
                .seal_value(&serialized, &record.metadata.allowed_peers)
                .await?;
        }

        self.commit_local(base_key, &record).await?;
        match self.dht.update(base_key, record).await {
            Ok(()) | Err(StorageError::QuorumFailed { .. }) => {
                let event = if grant {
                    StorageEvent::AccessGranted {
                        key: base_key.to_string(),
                        peer,
                    }
                } else {
                    StorageEvent::AccessRevoked {
                        key: base_key.to_string(),
                        peer,
                    }
                };
                self.events.emit(event);
                Ok(())
            }
            Err(e) => {
                self.rollback_local(base_key, Some(previous)).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Watch `base_key`; returns the current decoded value.
    pub async fn subscribe(&self, base_key: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_enabled()?;
        let current = self.dht.subscribe(base_key).await?;
        match current {
            Some(record) if !record.is_tombstone() && record.metadata.can_read(&self.local) => {
                self.index_record(base_key, &record).await;
                self.cache
                    .write()
                    .await
                    .insert(base_key.to_string(), record.clone());
                Ok(self.open_value(&record).await)
            }
            _ => Ok(None),
        }
    }

    pub async fn unsubscribe(&self, base_key: &str) -> Result<()> {
        self.ensure_enabled()?;
        self.dht.unsubscribe(base_key).await
    }

    /// Consume overlay notifications, re-emitting them as typed events
    /// in arrival order.
    async fn consume_notifications(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<DhtNotification>,
    ) {
        while let Some(DhtNotification::Updated { record, .. }) = rx.recv().await {
            let base_key = record.metadata.key.clone();

            if record.is_tombstone() {
                self.cache.write().await.remove(&base_key);
                self.crdt_states.write().await.remove(&base_key);
                let _ = self.persistence.delete(&base_key).await;
                let deleted_by = record
                    .value
                    .get("deletedBy")
                    .and_then(|v| v.as_str())
                    .and_then(|s| PeerId::from_hex(s).ok());
                if !is_internal_key(&base_key) {
                    self.events.emit(StorageEvent::DataDeleted {
                        key: base_key,
                        deleted_by,
                    });
                }
                continue;
            }

            // Merge incoming CRDT state; the owner republishes the merged
            // value so replicas converge, non-owners stay quiet to avoid
            // cycles.
            let mut merged_record = record.clone();
            if record.metadata.enable_crdt {
                if let Some(remote_state) = &record.crdt {
                    let (changed, state) = {
                        let mut states = self.crdt_states.write().await;
                        let state = states.entry(base_key.clone()).or_default();
                        let changed = state.merge_state(remote_state);
                        (changed, state.clone())
                    };
                    merged_record.value = state.materialize();
                    merged_record.crdt = Some(state);
                    if changed && record.metadata.owner == self.local {
                        merged_record.metadata.updated_at = now_ms();
                        let _ = self.commit_local(&base_key, &merged_record).await;
                        let _ = self.dht.update(&base_key, merged_record.clone()).await;
                    }
                }
            }

            let supersedes = match self.cache.read().await.get(&base_key) {
                Some(existing) => merged_record.supersedes(existing) || merged_record.metadata.enable_crdt,
                None => true,
            };
            if supersedes {
                self.index_record(&base_key, &merged_record).await;
                self.cache
                    .write()
                    .await
                    .insert(base_key.clone(), merged_record.clone());
            }

            let value = self
                .open_value(&merged_record)
                .await
                .unwrap_or(serde_json::Value::Null);
            if !is_internal_key(&base_key) {
                self.events.emit(StorageEvent::DataUpdated {
                    key: base_key,
                    value,
                    version: merged_record.metadata.version,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Bulk and search
    // ------------------------------------------------------------------

    /// Store many records, bounding concurrency to the configured
    /// fan-out.
    pub async fn bulk_store(
        &self,
        items: Vec<(String, serde_json::Value, StoreOptions)>,
    ) -> BulkOutcome<()> {
        let fanout = self.config.bulk_fanout.max(1);
        let results: Vec<(String, Result<()>)> = stream::iter(items)
            .map(|(key, value, options)| async move {
                let result = self.store(&key, value, options).await;
                (key, result)
            })
            .buffer_unordered(fanout)
            .collect()
            .await;

        let mut outcome = BulkOutcome::default();
        for (key, result) in results {
            outcome.absorb(key, result);
        }
        outcome
    }

    pub async fn bulk_retrieve(
        &self,
        keys: Vec<String>,
    ) -> BulkOutcome<Option<serde_json::Value>> {
        let fanout = self.config.bulk_fanout.max(1);
        let results: Vec<(String, Result<Option<serde_json::Value>>)> = stream::iter(keys)
            .map(|key| async move {
                let result = self.retrieve(&key, false).await;
                (key, result)
            })
            .buffer_unordered(fanout)
            .collect()
            .await;

        let mut outcome = BulkOutcome::default();
        for (key, result) in results {
            outcome.absorb(key, result);
        }
        outcome
    }

    /// Delete every owned key under `prefix`.
    pub async fn bulk_delete(&self, prefix: &str) -> BulkOutcome<()> {
        let keys: Vec<String> = {
            let owned = self.owned_keys.read().await;
            owned
                .iter()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        };
        let fanout = self.config.bulk_fanout.max(1);
        let results: Vec<(String, Result<()>)> = stream::iter(keys)
            .map(|key| async move {
                let result = self.delete(&key).await;
                (key, result)
            })
            .buffer_unordered(fanout)
            .collect()
            .await;

        let mut outcome = BulkOutcome::default();
        for (key, result) in results {
            outcome.absorb(key, result);
        }
        outcome
    }

    /// Locally known base keys under `prefix`, sorted.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self
            .cache
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix) && !is_internal_key(k))
            .cloned()
            .collect();
        for key in self.persistence.keys().await? {
            if key.starts_with(prefix) && !is_internal_key(&key) {
                keys.insert(key);
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Substring search over locally held records.
    pub async fn search(&self, query: &str, scope: SearchScope) -> Vec<SearchResult> {
        let cache = self.cache.read().await;
        let mut hits = Vec::new();
        for (key, record) in cache.iter() {
            if record.is_tombstone() || is_internal_key(key) {
                continue;
            }
            let matched = match scope {
                SearchScope::Key => key.contains(query),
                SearchScope::Value => record.value.to_string().contains(query),
                SearchScope::Metadata => serde_json::to_string(&record.metadata)
                    .map(|s| s.contains(query))
                    .unwrap_or(false),
            };
            if matched {
                hits.push(SearchResult {
                    key: key.clone(),
                    space: record.metadata.space,
                    owner: record.metadata.owner,
                });
            }
        }
        hits.sort_by(|a, b| a.key.cmp(&b.key));
        hits
    }

    // ------------------------------------------------------------------
    // Backup / restore
    // ------------------------------------------------------------------

    /// Export every owned key as a versioned blob.
    pub async fn backup(&self) -> Result<serde_json::Value> {
        self.ensure_enabled()?;
        let owned: Vec<String> = self
            .owned_keys
            .read()
            .await
            .iter()
            .filter(|k| !is_internal_key(k))
            .cloned()
            .collect();
        let mut entries = Vec::with_capacity(owned.len());
        for key in owned {
            let Some(record) = self.load_local(&key).await else {
                continue;
            };
            let value = self
                .open_value(&record)
                .await
                .unwrap_or(record.value.clone());
            entries.push(serde_json::json!({
                "key": key,
                "value": value,
                "metadata": serde_json::to_value(&record.metadata)
                    .map_err(|e| StorageError::Internal(anyhow::anyhow!("{}", e)))?,
            }));
        }
        Ok(serde_json::json!({
            "version": 1,
            "timestamp": now_ms(),
            "peerId": self.local.to_hex(),
            "keys": entries,
        }))
    }

    /// Replay a backup blob as store calls.
    pub async fn restore(&self, blob: serde_json::Value, overwrite: bool) -> Result<BulkOutcome<()>> {
        self.ensure_enabled()?;
        let entries = blob
            .get("keys")
            .and_then(|k| k.as_array())
            .ok_or_else(|| StorageError::Internal(anyhow::anyhow!("malformed backup blob")))?;

        let mut outcome = BulkOutcome::default();
        for entry in entries {
            let Some(key) = entry.get("key").and_then(|k| k.as_str()) else {
                continue;
            };
            let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
            let metadata: Option<RecordMetadata> = entry
                .get("metadata")
                .and_then(|m| serde_json::from_value(m.clone()).ok());

            if !overwrite && self.space_index.read().await.contains_key(key) {
                outcome
                    .errors
                    .push((key.to_string(), "exists and overwrite is off".to_string()));
                outcome.failed.push(key.to_string());
                continue;
            }

            let options = match &metadata {
                Some(meta) => StoreOptions {
                    space: Some(meta.space),
                    ttl: meta.ttl,
                    enable_crdt: meta.enable_crdt,
                    allowed_peers: meta.allowed_peers.iter().copied().collect(),
                    ..StoreOptions::default()
                },
                None => StoreOptions::in_space(StorageSpace::Public),
            };
            let result = self.store(key, value, options).await;
            outcome.absorb(key.to_string(), result);
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub async fn get_stats(&self) -> StorageStats {
        let cache = self.cache.read().await;
        let user_records: Vec<_> = cache
            .iter()
            .filter(|(k, _)| !is_internal_key(k))
            .collect();
        let total_size: u64 = user_records
            .iter()
            .map(|(_, r)| serde_json::to_vec(&r.value).map(|b| b.len() as u64).unwrap_or(0))
            .sum();
        StorageStats {
            enabled: self.is_enabled(),
            item_count: user_records.len(),
            total_size,
            owned_keys: self
                .owned_keys
                .read()
                .await
                .iter()
                .filter(|k| !is_internal_key(k))
                .count(),
            total_keys: self
                .space_index
                .read()
                .await
                .keys()
                .filter(|k| !is_internal_key(k))
                .count(),
            crdt_keys: self.crdt_states.read().await.len(),
            encryption_enabled: self.encryption_active.load(Ordering::Relaxed),
            max_value_size: self.config.max_value_size,
        }
    }

    pub async fn dht_stats(&self) -> DhtStats {
        self.dht.stats().await
    }

    // ------------------------------------------------------------------
    // Crypto plumbing
    // ------------------------------------------------------------------

    async fn encryption_ready(&self) -> bool {
        if !self.encryption_active.load(Ordering::Relaxed) {
            return false;
        }
        self.await_keypair().await.is_some()
    }

    /// Wait (bounded) for the lazily-initialized keypair. On timeout the
    /// peer disables encryption and stores unencrypted.
    async fn await_keypair(&self) -> Option<Keypair> {
        if let Some(pair) = self.keypair.read().await.clone() {
            return Some(pair);
        }
        let mut status = self.crypto_status.subscribe();
        let deadline = std::time::Duration::from_millis(self.config.crypto_init_timeout_ms);
        let waited = tokio::time::timeout(deadline, async {
            loop {
                match *status.borrow() {
                    CryptoStatus::Ready => return true,
                    CryptoStatus::Failed => return false,
                    CryptoStatus::Pending => {}
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match waited {
            Ok(true) => self.keypair.read().await.clone(),
            Ok(false) => None,
            Err(_) => {
                warn!("crypto initialization timed out, disabling encryption");
                self.encryption_active.store(false, Ordering::Relaxed);
                None
            }
        }
    }

    /// Seal `plaintext` for the owner and every peer on the ACL.
    async fn seal_value(
        &self,
        plaintext: &[u8],
        allowed: &BTreeSet<PeerId>,
    ) -> Result<serde_json::Value> {
        let keypair = self.await_keypair().await.ok_or(StorageError::CryptoUnavailable)?;
        let mut sealed = serde_json::Map::new();

        let own = self
            .crypto
            .encrypt_message_with_meta(plaintext, &keypair.public)
            .map_err(StorageError::Internal)?;
        sealed.insert(
            self.local.to_hex(),
            serde_json::to_value(own).map_err(|e| StorageError::Internal(anyhow::anyhow!("{}", e)))?,
        );

        for peer in allowed {
            if *peer == self.local {
                continue;
            }
            match self.lookup_pubkey(*peer).await {
                Some(public) => {
                    let envelope = self
                        .crypto
                        .encrypt_message_with_meta(plaintext, &public)
                        .map_err(StorageError::Internal)?;
                    sealed.insert(
                        peer.to_hex(),
                        serde_json::to_value(envelope)
                            .map_err(|e| StorageError::Internal(anyhow::anyhow!("{}", e)))?,
                    );
                }
                None => {
                    warn!(peer = %peer, "no published key for reader, skipping seal");
                }
            }
        }

        Ok(serde_json::json!({ "sealed": sealed }))
    }

    /// Open a record's value for the local peer. `None` when the value is
    /// sealed and no envelope is addressed to us (or decryption fails).
    async fn open_value(&self, record: &Record) -> Option<serde_json::Value> {
        if !record.encrypted {
            return Some(record.value.clone());
        }
        let envelopes = record.value.get("sealed")?.as_object()?;
        let mine = envelopes.get(&self.local.to_hex())?;
        let envelope: SealedEnvelope = serde_json::from_value(mine.clone()).ok()?;
        let keypair = self.await_keypair().await?;
        let plaintext = self
            .crypto
            .decrypt_message_with_meta(&envelope, &keypair)
            .ok()?;
        serde_json::from_slice(&plaintext).ok()
    }

    /// Announce this peer's encryption public key under the well-known
    /// directory prefix so owners can seal for granted readers.
    async fn publish_own_pubkey(&self) -> Result<()> {
        let keypair = self.await_keypair().await.ok_or(StorageError::CryptoUnavailable)?;
        let key = format!("{}{}", PUBKEY_PREFIX, self.local.to_hex());
        let value = serde_json::json!({ "publicKey": keypair.public.to_hex() });

        if self.space_index.read().await.contains_key(&key) {
            self.update(&key, value, UpdateOptions::default()).await
        } else {
            self.store(&key, value, StoreOptions::in_space(StorageSpace::Public))
                .await
        }
    }

    /// Resolve a peer's published encryption key.
    async fn lookup_pubkey(&self, peer: PeerId) -> Option<PublicKey> {
        let key = format!("{}{}", PUBKEY_PREFIX, peer.to_hex());
        let record = match self.load_local(&key).await {
            Some(record) => Some(record),
            None => self.dht.get(&key, false).await.ok().flatten(),
        }?;
        let hex = record.value.get("publicKey")?.as_str()?;
        PublicKey::from_hex(hex).ok()
    }

    // ------------------------------------------------------------------
    // Local state helpers
    // ------------------------------------------------------------------

    async fn key_lock(&self, base_key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.write_locks.lock().await;
            locks
                .entry(base_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// What we currently know about a base key's space and owner,
    /// consulting the overlay when the local index has no entry.
    async fn resolve_space_entry(&self, base_key: &str) -> Option<SpaceEntry> {
        if let Some(entry) = self.space_index.read().await.get(base_key) {
            return Some(*entry);
        }
        let record = self.dht.get(base_key, false).await.ok().flatten()?;
        let entry = SpaceEntry {
            space: record.metadata.space,
            owner: record.metadata.owner,
        };
        self.space_index
            .write()
            .await
            .insert(base_key.to_string(), entry);
        Some(entry)
    }

    async fn index_record(&self, base_key: &str, record: &Record) {
        self.space_index.write().await.insert(
            base_key.to_string(),
            SpaceEntry {
                space: record.metadata.space,
                owner: record.metadata.owner,
            },
        );
        if record.metadata.owner == self.local {
            self.owned_keys.write().await.insert(base_key.to_string());
        }
    }

    async fn load_local(&self, base_key: &str) -> Option<Record> {
        if let Some(record) = self.cache.read().await.get(base_key) {
            return Some(record.clone());
        }
        let bytes = self.persistence.get(base_key).await.ok()??;
        let record: Record = serde_json::from_slice(&bytes).ok()?;
        self.cache
            .write()
            .await
            .insert(base_key.to_string(), record.clone());
        Some(record)
    }

    async fn commit_local(&self, base_key: &str, record: &Record) -> Result<()> {
        self.index_record(base_key, record).await;
        self.cache
            .write()
            .await
            .insert(base_key.to_string(), record.clone());
        let bytes = serde_json::to_vec(record)
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("{}", e)))?;
        self.persistence
            .set(base_key, bytes, None)
            .await
            .map_err(StorageError::Internal)?;
        Ok(())
    }

    async fn rollback_local(&self, base_key: &str, previous: Option<Record>) {
        match previous {
            Some(record) => {
                let _ = self.commit_local(base_key, &record).await;
            }
            None => {
                self.cache.write().await.remove(base_key);
                self.owned_keys.write().await.remove(base_key);
                self.space_index.write().await.remove(base_key);
                self.crdt_states.write().await.remove(base_key);
                let _ = self.persistence.delete(base_key).await;
            }
        }
    }
}
