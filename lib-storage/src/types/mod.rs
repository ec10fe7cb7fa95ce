//! Core storage type definitions and type aliases
//!
//! Fundamental types used throughout the storage system: the routing key
//! digest, record and metadata shapes, per-peer configuration, and the
//! statistics reported to callers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub mod config_types;
pub mod record;
pub mod stats_types;

pub use config_types::*;
pub use record::*;
pub use stats_types::*;

/// Width of a routing key digest in bytes (160 bits).
pub const KEY_ID_LEN: usize = 20;

/// Routing address of a record: the 160-bit digest of its base key.
///
/// Same digest on every peer, no salts; replica placement and request
/// routing are both defined on the XOR distance between a `KeyId` and
/// peer identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    /// Digest a base key into its routing address.
    pub fn for_key(base_key: &str) -> Self {
        let digest = blake3::hash(base_key.as_bytes());
        let mut bytes = [0u8; KEY_ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..KEY_ID_LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        if s.len() != KEY_ID_LEN * 2 {
            anyhow::bail!("key id must be 40 hex chars, got {}", s.len());
        }
        let decoded = hex::decode(s)?;
        let mut bytes = [0u8; KEY_ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        KeyId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Current epoch time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
