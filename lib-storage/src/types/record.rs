//! Record and metadata shapes
//!
//! The record is the unit of storage published under a key digest. Its
//! metadata carries the storage space, ownership, access control list,
//! and the version counter replicas use to order updates. Records travel
//! JSON-encoded, so every field name here is part of the wire format.

use lib_peer::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::consistency::CrdtState;

/// Record type tag expected on every frame that carries storage data.
pub const RECORD_TYPE: &str = "storage";

/// The three access regimes a base key can live under.
///
/// A given base key lives in at most one space across the whole mesh;
/// the space is fixed for the life of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageSpace {
    Private,
    Public,
    Frozen,
}

impl StorageSpace {
    /// Readable by anyone?
    pub fn is_public(&self) -> bool {
        matches!(self, StorageSpace::Public | StorageSpace::Frozen)
    }

    /// Content immutable after the first successful write?
    pub fn is_immutable(&self) -> bool {
        matches!(self, StorageSpace::Frozen)
    }

    /// Resolve a space from the legacy boolean flags older callers pass.
    pub fn from_legacy_flags(is_public: bool, is_immutable: bool) -> Self {
        match (is_public, is_immutable) {
            (_, true) => StorageSpace::Frozen,
            (true, false) => StorageSpace::Public,
            (false, false) => StorageSpace::Private,
        }
    }
}

impl std::fmt::Display for StorageSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageSpace::Private => "private",
            StorageSpace::Public => "public",
            StorageSpace::Frozen => "frozen",
        };
        write!(f, "{}", s)
    }
}

/// Metadata attached to every stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// The caller-chosen base key.
    pub key: String,
    /// Always [`RECORD_TYPE`]; frames with another tag are rejected.
    #[serde(rename = "type")]
    pub record_type: String,
    pub space: StorageSpace,
    /// The authoritative writer.
    pub owner: PeerId,
    pub is_public: bool,
    pub is_immutable: bool,
    /// Read ACL for private records.
    #[serde(default)]
    pub allowed_peers: BTreeSet<PeerId>,
    /// Epoch milliseconds.
    pub created_at: u64,
    /// Epoch milliseconds; non-decreasing per record.
    pub updated_at: u64,
    /// Starts at 1, strictly increases on owner updates.
    pub version: u64,
    /// Optional expiry, milliseconds after `updated_at`.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Opt-in to the vector-clock merge path.
    #[serde(default, rename = "enableCRDT")]
    pub enable_crdt: bool,
}

impl RecordMetadata {
    pub fn new(key: String, space: StorageSpace, owner: PeerId, now: u64) -> Self {
        Self {
            key,
            record_type: RECORD_TYPE.to_string(),
            space,
            owner,
            is_public: space.is_public(),
            is_immutable: space.is_immutable(),
            allowed_peers: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            version: 1,
            ttl: None,
            enable_crdt: false,
        }
    }

    /// A peer may read this record's content iff the space is public or
    /// the peer is the owner or on the ACL.
    pub fn can_read(&self, peer: &PeerId) -> bool {
        self.space.is_public() || self.owner == *peer || self.allowed_peers.contains(peer)
    }
}

/// The unit of storage published under a key digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// User data. Plaintext JSON for public/frozen records; for private
    /// records an object of per-reader sealed envelopes.
    pub value: serde_json::Value,
    pub metadata: RecordMetadata,
    /// True when `value` is ciphertext.
    #[serde(default)]
    pub encrypted: bool,
    /// Who sealed the value (always the owner).
    #[serde(default)]
    pub encrypted_by: Option<PeerId>,
    /// Vector-clock merge state, present only on CRDT-enabled records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crdt: Option<CrdtState>,
}

impl Record {
    pub fn new(value: serde_json::Value, metadata: RecordMetadata) -> Self {
        Self {
            value,
            metadata,
            encrypted: false,
            encrypted_by: None,
            crdt: None,
        }
    }

    /// Build the tombstone that replaces this record on delete.
    pub fn tombstone(&self, deleted_by: PeerId, now: u64) -> Record {
        let mut metadata = self.metadata.clone();
        metadata.version += 1;
        metadata.updated_at = now;
        Record {
            value: serde_json::json!({
                "deleted": true,
                "deletedAt": now,
                "deletedBy": deleted_by.to_hex(),
            }),
            metadata,
            encrypted: false,
            encrypted_by: None,
            crdt: None,
        }
    }

    /// Is this record a deletion marker?
    pub fn is_tombstone(&self) -> bool {
        self.value
            .get("deleted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Has the record's TTL elapsed at `now`?
    pub fn is_expired(&self, now: u64) -> bool {
        match self.metadata.ttl {
            Some(ttl) => now > self.metadata.updated_at.saturating_add(ttl),
            None => false,
        }
    }

    /// Version-ordering rule replicas apply before accepting a store:
    /// strictly newer version, or same version with a later update time,
    /// ties broken by owner id so concurrent writers converge.
    pub fn supersedes(&self, other: &Record) -> bool {
        let a = (
            self.metadata.version,
            self.metadata.updated_at,
            self.metadata.owner,
        );
        let b = (
            other.metadata.version,
            other.metadata.updated_at,
            other.metadata.owner,
        );
        a > b
    }

    /// Structural validation applied to records arriving off the wire.
    pub fn validate_wire(&self) -> Result<(), String> {
        if self.metadata.record_type != RECORD_TYPE {
            return Err(format!(
                "unexpected record type '{}'",
                self.metadata.record_type
            ));
        }
        if self.metadata.version == 0 {
            return Err("record version must be >= 1".to_string());
        }
        if self.metadata.is_public != self.metadata.space.is_public()
            || self.metadata.is_immutable != self.metadata.space.is_immutable()
        {
            return Err("space flags inconsistent with space".to_string());
        }
        if self.encrypted && self.encrypted_by.is_none() {
            return Err("encrypted record without encryptedBy".to_string());
        }
        Ok(())
    }
}
