//! Overlay DHT
//!
//! Content-addressed storage routing and subscription fan-out across the
//! live peer set. Records are placed on the K connected peers nearest a
//! key digest; requests from non-replicas forward toward the replica set
//! under a hop budget; watchers register at every replica and receive
//! `DHT_NOTIFY` pushes when a replica accepts a newer record.

pub mod messaging;
pub mod routing;
pub mod subscriptions;
pub mod wire;

pub use messaging::RequestTracker;
pub use routing::ReplicaRouter;
pub use subscriptions::{SubscriptionTable, WatchTable};
pub use wire::{Frame, FrameBody};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lib_mesh::{MeshEvent, MeshSession};
use lib_peer::PeerId;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::{Result, StorageError};
use crate::types::{now_ms, DhtStats, KeyId, Record, StorageConfig};

/// Storage-layer validation applied before a replica accepts a store.
///
/// The overlay stays policy-free; the engine injects the space and
/// ownership rules through this seam.
pub trait RecordPolicy: Send + Sync {
    /// Reject with a reason string, or accept.
    fn validate_store(&self, incoming: &Record, existing: Option<&Record>) -> std::result::Result<(), String>;
}

/// Policy that only enforces structural validity. Used by bare DHT tests.
#[derive(Debug, Default)]
pub struct AcceptAllPolicy;

impl RecordPolicy for AcceptAllPolicy {
    fn validate_store(&self, _incoming: &Record, _existing: Option<&Record>) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Push notifications delivered to the storage engine.
#[derive(Debug, Clone)]
pub enum DhtNotification {
    /// A watched key changed at a replica.
    Updated { key_id: KeyId, record: Record },
}

/// The overlay DHT node.
pub struct WebDht {
    local: PeerId,
    config: StorageConfig,
    mesh: Arc<MeshSession>,
    policy: Arc<dyn RecordPolicy>,
    router: RwLock<ReplicaRouter>,
    /// Local replica index: every key this peer currently holds.
    records: RwLock<HashMap<KeyId, Record>>,
    /// Remote watchers registered at this peer.
    subs: SubscriptionTable,
    /// Keys this peer watches.
    watches: WatchTable,
    tracker: Arc<RequestTracker>,
    notify_tx: mpsc::UnboundedSender<DhtNotification>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<DhtNotification>>>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl WebDht {
    /// Stable digest of a base key. Same on every peer; no salts.
    pub fn hash(base_key: &str) -> KeyId {
        KeyId::for_key(base_key)
    }

    pub fn new(
        local: PeerId,
        mesh: Arc<MeshSession>,
        config: StorageConfig,
        policy: Arc<dyn RecordPolicy>,
    ) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            local,
            config,
            mesh,
            policy,
            router: RwLock::new(ReplicaRouter::new(local)),
            records: RwLock::new(HashMap::new()),
            subs: SubscriptionTable::new(),
            watches: WatchTable::new(),
            tracker: Arc::new(RequestTracker::new()),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Start the inbox, membership, and maintenance loops.
    pub async fn start(self: &Arc<Self>) {
        let incoming = self.mesh.incoming().await;
        let events = self.mesh.events().await;

        // Seed the router with peers already connected.
        {
            let mut router = self.router.write().await;
            for peer in self.mesh.connected_peers().await {
                router.peer_up(peer);
            }
        }

        if let Some(rx) = incoming {
            tokio::spawn(Self::inbox_loop(Arc::clone(self), rx));
        }
        if let Some(rx) = events {
            tokio::spawn(Self::membership_loop(Arc::clone(self), rx));
        }
        tokio::spawn(Self::maintenance_loop(Arc::clone(self)));
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Take the notification receiver. Can be taken once.
    pub async fn notifications(&self) -> Option<mpsc::UnboundedReceiver<DhtNotification>> {
        self.notify_rx.lock().await.take()
    }

    /// Publish a record to the K replicas nearest its key digest.
    ///
    /// Succeeds once a write quorum of replicas acknowledged. With zero
    /// replicas reachable the routing layer reports `DhtUnavailable`;
    /// with some but not enough acks, `QuorumFailed`.
    pub async fn put(&self, base_key: &str, record: Record) -> Result<()> {
        let key = Self::hash(base_key);
        let k = self.config.replication_factor;
        let replicas = self.router.read().await.replicas_for(&key, k);
        let quorum = self.config.write_quorum(replicas.len());

        let mut acked = 0usize;
        let mut replied = 0usize;

        for replica in &replicas {
            if *replica == self.local {
                match self.accept_store(self.local, key, record.clone()).await {
                    Ok(()) => {
                        acked += 1;
                        replied += 1;
                    }
                    Err(reason) => {
                        replied += 1;
                        warn!(key = base_key, reason, "local store rejected");
                    }
                }
                continue;
            }
            match self
                .rpc(
                    *replica,
                    FrameBody::Store {
                        key_id: key,
                        record: record.clone(),
                        ttl_ms: record.metadata.ttl,
                    },
                )
                .await
            {
                Ok(reply) => {
                    replied += 1;
                    match reply.body {
                        FrameBody::StoreAck { .. } => acked += 1,
                        FrameBody::StoreReject { reason, .. } => {
                            debug!(key = base_key, replica = %replica, reason, "store rejected");
                        }
                        other => {
                            debug!(key = base_key, kind = ?other, "unexpected store reply");
                        }
                    }
                }
                Err(e) => {
                    debug!(key = base_key, replica = %replica, error = %e, "store dispatch failed");
                }
            }
        }

        if acked >= quorum {
            Ok(())
        } else if replied == 0 {
            Err(StorageError::DhtUnavailable(base_key.to_string()))
        } else {
            Err(StorageError::QuorumFailed {
                acked,
                required: quorum,
            })
        }
    }

    /// Fetch the current record for a base key.
    pub async fn get(&self, base_key: &str, force_refresh: bool) -> Result<Option<Record>> {
        let key = Self::hash(base_key);
        let now = now_ms();

        if !force_refresh {
            if let Some(local) = self.records.read().await.get(&key) {
                if !local.is_expired(now) {
                    return Ok(Some(local.clone()));
                }
            }
        }

        let k = self.config.replication_factor;
        let replicas = self.router.read().await.replicas_for(&key, k);
        let self_is_replica = replicas.contains(&self.local);

        // The local replica index is as authoritative as any other
        // replica, so it stays a candidate even on a forced refresh.
        let mut best: Option<Record> = self.records.read().await.get(&key).cloned();
        let mut reached = self_is_replica;

        for replica in replicas.iter().filter(|p| **p != self.local) {
            match self
                .rpc(
                    *replica,
                    FrameBody::Get {
                        key_id: key,
                        force_refresh,
                    },
                )
                .await
            {
                Ok(reply) => {
                    reached = true;
                    if let FrameBody::GetReply {
                        record: Some(record),
                        ..
                    } = reply.body
                    {
                        if record.validate_wire().is_ok()
                            && KeyId::for_key(&record.metadata.key) == key
                        {
                            best = match best {
                                Some(current) if current.supersedes(&record) => Some(current),
                                _ => Some(record),
                            };
                        }
                    }
                }
                Err(e) => {
                    debug!(key = base_key, replica = %replica, error = %e, "get dispatch failed");
                }
            }
        }

        if !reached {
            return Err(StorageError::DhtUnavailable(base_key.to_string()));
        }

        // Refresh our own copy when we are a designated replica.
        if let Some(record) = &best {
            if self_is_replica {
                let _ = self.accept_store(self.local, key, record.clone()).await;
            }
        }

        Ok(best.filter(|r| !r.is_expired(now)))
    }

    /// Publish an updated record. Same placement as `put`; subscriber
    /// fan-out happens at each replica that accepts the newer version.
    pub async fn update(&self, base_key: &str, record: Record) -> Result<()> {
        self.put(base_key, record).await
    }

    /// Register this peer as a watcher at every replica of `base_key`.
    /// Returns the current record, newest version wins across replicas.
    pub async fn subscribe(&self, base_key: &str) -> Result<Option<Record>> {
        let key = Self::hash(base_key);
        self.watches.add(key, base_key.to_string()).await;

        let k = self.config.replication_factor;
        let replicas = self.router.read().await.replicas_for(&key, k);

        let mut current: Option<Record> = None;
        let mut reached = false;

        for replica in replicas {
            if replica == self.local {
                self.subs.add(key, self.local).await;
                reached = true;
                if let Some(local) = self.records.read().await.get(&key) {
                    current = match current {
                        Some(c) if c.supersedes(local) => Some(c),
                        _ => Some(local.clone()),
                    };
                }
                continue;
            }
            match self.rpc(replica, FrameBody::Subscribe { key_id: key }).await {
                Ok(reply) => {
                    reached = true;
                    if let FrameBody::SubscribeAck {
                        current_record: Some(record),
                        ..
                    } = reply.body
                    {
                        if record.validate_wire().is_ok() {
                            current = match current {
                                Some(c) if c.supersedes(&record) => Some(c),
                                _ => Some(record),
                            };
                        }
                    }
                }
                Err(e) => {
                    debug!(key = base_key, replica = %replica, error = %e, "subscribe dispatch failed");
                }
            }
        }

        if !reached {
            self.watches.remove(&key).await;
            return Err(StorageError::DhtUnavailable(base_key.to_string()));
        }
        Ok(current)
    }

    /// Deregister this peer's watch on `base_key`.
    pub async fn unsubscribe(&self, base_key: &str) -> Result<()> {
        let key = Self::hash(base_key);
        self.watches.remove(&key).await;
        self.subs.remove(key, &self.local).await;

        let k = self.config.replication_factor;
        let replicas = self.router.read().await.replicas_for(&key, k);
        for replica in replicas {
            if replica == self.local {
                continue;
            }
            let frame = self.make_frame(FrameBody::Unsubscribe { key_id: key }, replica, 0);
            let _ = self.send_frame(replica, &frame).await;
        }
        Ok(())
    }

    /// Record currently held in the local replica index.
    pub async fn local_record(&self, key: &KeyId) -> Option<Record> {
        self.records.read().await.get(key).cloned()
    }

    /// Drop a key from the local replica index.
    pub async fn evict_local(&self, key: &KeyId) {
        self.records.write().await.remove(key);
    }

    /// Wipe the local replica index. Used when the engine above clears
    /// its storage; replicas elsewhere are untouched.
    pub async fn clear_local(&self) {
        self.records.write().await.clear();
    }

    pub async fn stats(&self) -> DhtStats {
        DhtStats {
            connected_peers: self.router.read().await.mesh_size() - 1,
            replica_records: self.records.read().await.len(),
            watched_keys: self.watches.len().await,
            subscriber_entries: self.subs.entry_count().await,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Frame plumbing
    // ------------------------------------------------------------------

    fn make_frame(&self, body: FrameBody, to: PeerId, ttl: u8) -> Frame {
        Frame {
            body,
            request_id: self.tracker.next_request_id(),
            from: self.local,
            to,
            ttl,
        }
    }

    async fn send_frame(&self, to: PeerId, frame: &Frame) -> Result<()> {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        messaging::send_with_retry(
            &self.mesh,
            to,
            frame,
            self.config.retry_attempts,
            self.config.retry_backoff_ms,
        )
        .await
    }

    async fn rpc(&self, to: PeerId, body: FrameBody) -> Result<Frame> {
        let ttl = {
            let router = self.router.read().await;
            self.config.hop_budget(router.mesh_size())
        };
        let frame = self.make_frame(body, to, ttl);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        messaging::send_and_wait(
            &self.mesh,
            &self.tracker,
            to,
            frame,
            self.config.rpc_timeout_ms,
            self.config.retry_attempts,
            self.config.retry_backoff_ms,
        )
        .await
    }

    async fn reply(&self, request: &Frame, body: FrameBody) {
        let reply = Frame {
            body,
            request_id: request.request_id,
            from: self.local,
            to: request.from,
            ttl: 0,
        };
        if let Err(e) = self.send_frame(request.from, &reply).await {
            debug!(to = %request.from, error = %e, "reply send failed");
        }
    }

    // ------------------------------------------------------------------
    // Store acceptance
    // ------------------------------------------------------------------

    /// Correctness gate for incoming stores: replica membership in our
    /// view, storage policy, then version monotonicity.
    async fn accept_store(
        &self,
        from: PeerId,
        key: KeyId,
        record: Record,
    ) -> std::result::Result<(), String> {
        record.validate_wire()?;
        if KeyId::for_key(&record.metadata.key) != key {
            return Err("key digest does not match base key".to_string());
        }

        {
            let router = self.router.read().await;
            if !router.is_replica(&self.local, &key, self.config.replication_factor) {
                return Err("not a replica for this key".to_string());
            }
        }

        let existing = self.records.read().await.get(&key).cloned();
        self.policy.validate_store(&record, existing.as_ref())?;

        if let Some(existing) = &existing {
            if !record.supersedes(existing) {
                return Err(format!(
                    "stale version {} (have {})",
                    record.metadata.version, existing.metadata.version
                ));
            }
        }

        self.records.write().await.insert(key, record.clone());
        self.notify_subscribers(key, &record, Some(from)).await;
        Ok(())
    }

    /// Push `DHT_NOTIFY` to every watcher of `key`, skipping the
    /// originator of the change.
    async fn notify_subscribers(&self, key: KeyId, record: &Record, skip: Option<PeerId>) {
        for subscriber in self.subs.subscribers(&key).await {
            if Some(subscriber) == skip {
                continue;
            }
            if subscriber == self.local {
                if self.watches.contains(&key).await {
                    let _ = self.notify_tx.send(DhtNotification::Updated {
                        key_id: key,
                        record: record.clone(),
                    });
                }
                continue;
            }
            let frame = self.make_frame(
                FrameBody::Notify {
                    key_id: key,
                    record: record.clone(),
                },
                subscriber,
                1,
            );
            if let Err(e) = self.send_frame(subscriber, &frame).await {
                debug!(subscriber = %subscriber, error = %e, "notify send failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------

    async fn inbox_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some((from, bytes)) = msg else { break };
                    self.handle_frame(from, bytes).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn handle_frame(&self, from: PeerId, bytes: Vec<u8>) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed frames are logged and dropped; the sender is
                // not faulted.
                warn!(from = %from, error = %e, "dropping invalid frame");
                return;
            }
        };

        if frame.body.is_reply() {
            self.tracker.complete(frame.request_id, frame).await;
            return;
        }

        match frame.body.clone() {
            FrameBody::Store { key_id, record, .. } => {
                let is_replica = {
                    let router = self.router.read().await;
                    router.is_replica(&self.local, &key_id, self.config.replication_factor)
                };
                if !is_replica {
                    self.forward_or_reject(frame).await;
                    return;
                }
                match self.accept_store(frame.from, key_id, record).await {
                    Ok(()) => self.reply(&frame, FrameBody::StoreAck { key_id }).await,
                    Err(reason) => {
                        self.reply(&frame, FrameBody::StoreReject { key_id, reason })
                            .await
                    }
                }
            }
            FrameBody::Get { key_id, .. } => {
                let held = self.records.read().await.get(&key_id).cloned();
                let is_replica = {
                    let router = self.router.read().await;
                    router.is_replica(&self.local, &key_id, self.config.replication_factor)
                };
                if held.is_none() && !is_replica {
                    self.forward_or_reject(frame).await;
                    return;
                }
                let stale = held
                    .as_ref()
                    .map(|r| r.is_expired(now_ms()))
                    .unwrap_or(false);
                self.reply(
                    &frame,
                    FrameBody::GetReply {
                        key_id,
                        record: held,
                        stale,
                    },
                )
                .await;
            }
            FrameBody::Subscribe { key_id } => {
                self.subs.add(key_id, frame.from).await;
                let current = self.records.read().await.get(&key_id).cloned();
                self.reply(
                    &frame,
                    FrameBody::SubscribeAck {
                        key_id,
                        current_record: current,
                    },
                )
                .await;
            }
            FrameBody::Unsubscribe { key_id } => {
                self.subs.remove(key_id, &frame.from).await;
            }
            FrameBody::Notify { key_id, record } => {
                if record.validate_wire().is_err()
                    || KeyId::for_key(&record.metadata.key) != key_id
                {
                    warn!(from = %from, "dropping invalid notify payload");
                    return;
                }
                // Deliver to the local watcher first.
                if self.watches.contains(&key_id).await {
                    let _ = self.notify_tx.send(DhtNotification::Updated {
                        key_id,
                        record: record.clone(),
                    });
                }
                // Replicas absorb the newer value and rebroadcast once to
                // their own subscriber set, never further.
                let is_replica = {
                    let router = self.router.read().await;
                    router.is_replica(&self.local, &key_id, self.config.replication_factor)
                };
                if is_replica && frame.ttl > 0 {
                    let newer = {
                        let records = self.records.read().await;
                        match records.get(&key_id) {
                            Some(existing) => record.supersedes(existing),
                            None => true,
                        }
                    };
                    if newer {
                        self.records.write().await.insert(key_id, record.clone());
                        for subscriber in self.subs.subscribers(&key_id).await {
                            if subscriber == frame.from || subscriber == self.local {
                                continue;
                            }
                            let rebroadcast = self.make_frame(
                                FrameBody::Notify {
                                    key_id,
                                    record: record.clone(),
                                },
                                subscriber,
                                0,
                            );
                            let _ = self.send_frame(subscriber, &rebroadcast).await;
                        }
                    }
                }
            }
            reply_kind => {
                debug!(kind = ?reply_kind, "reply frame without waiter");
            }
        }
    }

    /// A request we are not responsible for: forward to the nearest known
    /// replica under the hop budget, or report route exhaustion.
    async fn forward_or_reject(&self, frame: Frame) {
        let key_id = frame.body.key_id();
        if frame.ttl == 0 {
            match &frame.body {
                FrameBody::Store { .. } => {
                    self.reply(
                        &frame,
                        FrameBody::StoreReject {
                            key_id,
                            reason: "route exhausted".to_string(),
                        },
                    )
                    .await;
                }
                FrameBody::Get { .. } => {
                    self.reply(
                        &frame,
                        FrameBody::GetReply {
                            key_id,
                            record: None,
                            stale: false,
                        },
                    )
                    .await;
                }
                _ => {}
            }
            return;
        }

        let next = {
            let router = self.router.read().await;
            router.nearest_remote_replica(&key_id, self.config.replication_factor)
        };
        match next {
            Some(next) if next != frame.from => {
                // Keep the originator so the reply routes back directly.
                let forwarded = Frame {
                    ttl: frame.ttl - 1,
                    to: next,
                    ..frame
                };
                if let Err(e) = self.send_frame(next, &forwarded).await {
                    debug!(next = %next, error = %e, "forward failed");
                }
            }
            _ => {
                if let FrameBody::Store { .. } = frame.body {
                    self.reply(
                        &frame,
                        FrameBody::StoreReject {
                            key_id,
                            reason: "no replica known".to_string(),
                        },
                    )
                    .await;
                } else if let FrameBody::Get { .. } = frame.body {
                    self.reply(
                        &frame,
                        FrameBody::GetReply {
                            key_id,
                            record: None,
                            stale: false,
                        },
                    )
                    .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Replica maintenance
    // ------------------------------------------------------------------

    async fn membership_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<MeshEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        MeshEvent::PeerUp(peer) => {
                            self.router.write().await.peer_up(peer);
                        }
                        MeshEvent::PeerDown(peer) => {
                            self.router.write().await.peer_down(peer);
                            self.subs.remove_peer(&peer).await;
                        }
                    }
                    self.rebalance().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Re-evaluate replica duty for every held key after a membership
    /// change. Keys we are no longer responsible for are handed to the
    /// nearest current replica and evicted once it acks; keys we just
    /// became responsible for are refreshed from the other replicas.
    async fn rebalance(&self) {
        let k = self.config.replication_factor;
        let held: Vec<(KeyId, Record)> = {
            let records = self.records.read().await;
            records.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        for (key, record) in held {
            let replicas = self.router.read().await.replicas_for(&key, k);
            if replicas.contains(&self.local) {
                // Still responsible; pick up anything newer from peers
                // that replicated while we were out of the set.
                let _ = self.get(&record.metadata.key, true).await;
                continue;
            }

            let mut handed_off = false;
            for target in replicas {
                if target == self.local {
                    continue;
                }
                let outcome = self
                    .rpc(
                        target,
                        FrameBody::Store {
                            key_id: key,
                            record: record.clone(),
                            ttl_ms: record.metadata.ttl,
                        },
                    )
                    .await;
                if let Ok(Frame {
                    body: FrameBody::StoreAck { .. },
                    ..
                }) = outcome
                {
                    handed_off = true;
                    break;
                }
            }
            if handed_off {
                debug!(key = %key, "handed off replica after membership change");
                self.records.write().await.remove(&key);
            }
        }

        self.republish_subscriptions().await;
    }

    /// Re-register every watched key at its current replica set.
    async fn republish_subscriptions(&self) {
        let k = self.config.replication_factor;
        for (key, base_key) in self.watches.entries().await {
            let replicas = self.router.read().await.replicas_for(&key, k);
            for replica in replicas {
                if replica == self.local {
                    self.subs.add(key, self.local).await;
                    continue;
                }
                if let Err(e) = self.rpc(replica, FrameBody::Subscribe { key_id: key }).await {
                    debug!(key = base_key.as_str(), replica = %replica, error = %e, "subscription republish failed");
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let sweep_every = Duration::from_millis(30_000.min(self.config.tombstone_grace_ms.max(1)));
        let republish_every =
            Duration::from_millis(self.config.subscription_republish_interval_ms.max(1));
        let mut sweep = tokio::time::interval(sweep_every);
        let mut republish = tokio::time::interval(republish_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        republish.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        sweep.tick().await;
        republish.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep_expired().await,
                _ = republish.tick() => self.republish_subscriptions().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Purge TTL-expired records and tombstones past the grace period.
    async fn sweep_expired(&self) {
        let now = now_ms();
        let grace = self.config.tombstone_grace_ms;
        let mut records = self.records.write().await;
        records.retain(|_, record| {
            if record.is_tombstone() {
                now <= record.metadata.updated_at.saturating_add(grace)
            } else {
                !record.is_expired(now)
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordMetadata, StorageSpace};

    fn record_for(owner: PeerId, key: &str, version: u64) -> Record {
        let meta = RecordMetadata {
            version,
            ..RecordMetadata::new(key.into(), StorageSpace::Public, owner, now_ms())
        };
        Record::new(serde_json::json!({"v": version}), meta)
    }

    async fn solo_dht(tag: &[u8]) -> (Arc<WebDht>, PeerId) {
        let hub = lib_mesh::LocalHub::new();
        let local = PeerId::from_seed(tag);
        let mesh = hub.register(local, Default::default()).await;
        let config = StorageConfig {
            replication_factor: 1,
            ..StorageConfig::default()
        };
        let dht = WebDht::new(local, mesh, config, Arc::new(AcceptAllPolicy));
        dht.start().await;
        (dht, local)
    }

    #[tokio::test]
    async fn test_solo_put_get() {
        let (dht, local) = solo_dht(b"solo").await;
        let record = record_for(local, "greeting", 1);

        dht.put("greeting", record.clone()).await.unwrap();
        let fetched = dht.get("greeting", false).await.unwrap().unwrap();
        assert_eq!(fetched.value, record.value);
        assert_eq!(dht.stats().await.replica_records, 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (dht, local) = solo_dht(b"stale").await;

        dht.put("k", record_for(local, "k", 2)).await.unwrap();
        let result = dht.put("k", record_for(local, "k", 1)).await;
        assert!(matches!(result, Err(StorageError::QuorumFailed { .. })));

        let held = dht.get("k", false).await.unwrap().unwrap();
        assert_eq!(held.metadata.version, 2);
    }

    #[tokio::test]
    async fn test_key_digest_mismatch_is_rejected() {
        let (dht, local) = solo_dht(b"mismatch").await;
        let record = record_for(local, "other-key", 1);
        let result = dht.put("this-key", record).await;
        assert!(matches!(result, Err(StorageError::QuorumFailed { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_returns_current_value() {
        let (dht, local) = solo_dht(b"subscriber").await;
        dht.put("doc", record_for(local, "doc", 1)).await.unwrap();

        let current = dht.subscribe("doc").await.unwrap().unwrap();
        assert_eq!(current.metadata.version, 1);
        assert_eq!(dht.stats().await.watched_keys, 1);

        dht.unsubscribe("doc").await.unwrap();
        assert_eq!(dht.stats().await.watched_keys, 0);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_records() {
        let (dht, local) = solo_dht(b"sweeper").await;
        let mut record = record_for(local, "fleeting", 1);
        record.metadata.ttl = Some(1);
        record.metadata.updated_at = now_ms().saturating_sub(10);
        dht.records
            .write()
            .await
            .insert(WebDht::hash("fleeting"), record);

        dht.sweep_expired().await;
        assert_eq!(dht.stats().await.replica_records, 0);
    }
}
