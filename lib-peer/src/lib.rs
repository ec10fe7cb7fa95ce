//! Weft peer identity
//!
//! Every peer in the mesh owns a stable 160-bit identifier. Identifiers
//! double as positions in the XOR key space: records are placed on the
//! peers whose identifiers are nearest to the record's key digest.
//!
//! The identifier is exchanged as a 40-character lowercase hex string on
//! the wire and in configuration; internally it is a fixed 20-byte array
//! so distance math never allocates.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Width of a peer identifier in bytes (160 bits).
pub const PEER_ID_LEN: usize = 20;

/// Errors produced when parsing peer identifiers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("invalid peer id length: expected 40 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex in peer id: {0}")]
    InvalidHex(String),
}

/// A 160-bit peer identifier.
///
/// Equality, hashing, and ordering are defined on the underlying bytes;
/// lexicographic ordering is the tie-breaker used throughout replica
/// selection, so `Ord` must stay byte-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Build a peer id from raw bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 40-character lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, PeerIdError> {
        if s.len() != PEER_ID_LEN * 2 {
            return Err(PeerIdError::InvalidLength(s.len()));
        }
        let decoded = hex::decode(s).map_err(|e| PeerIdError::InvalidHex(e.to_string()))?;
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a deterministic identifier from a seed.
    ///
    /// Test fixtures use this to build reproducible topologies.
    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = blake3::hash(seed);
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..PEER_ID_LEN]);
        Self(bytes)
    }

    /// Underlying bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering (40 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another identifier.
    pub fn xor_distance(&self, other: &PeerId) -> [u8; PEER_ID_LEN] {
        self.distance_to(other.as_bytes())
    }

    /// XOR distance to an arbitrary 160-bit point (typically a key digest).
    pub fn distance_to(&self, point: &[u8; PEER_ID_LEN]) -> [u8; PEER_ID_LEN] {
        let mut out = [0u8; PEER_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ point[i];
        }
        out
    }

    /// Index of the most significant differing bit, 0..160.
    ///
    /// Identical identifiers return 160. Smaller values mean the ids share
    /// a shorter prefix, i.e. they are further apart.
    pub fn bucket_index(&self, other: &PeerId) -> u32 {
        let xor = self.xor_distance(other);
        for (i, byte) in xor.iter().enumerate() {
            if *byte != 0 {
                return (i as u32) * 8 + byte.leading_zeros();
            }
        }
        (PEER_ID_LEN * 8) as u32
    }
}

/// Order two peers by XOR distance to `target`, ties broken by
/// lexicographic peer id.
///
/// This is the comparator behind replica selection: sorting a peer set
/// with it yields the canonical replica list for a key.
pub fn cmp_distance(a: &PeerId, b: &PeerId, target: &[u8; PEER_ID_LEN]) -> Ordering {
    let da = a.distance_to(target);
    let db = b.distance_to(target);
    da.cmp(&db).then_with(|| a.cmp(b))
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8) -> PeerId {
        PeerId::from_bytes([id; PEER_ID_LEN])
    }

    #[test]
    fn test_hex_round_trip() {
        let id = PeerId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(PeerId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_rejects_bad_length() {
        assert_eq!(
            PeerId::from_hex("abcd"),
            Err(PeerIdError::InvalidLength(4))
        );
    }

    #[test]
    fn test_rejects_non_hex() {
        let s = "zz".repeat(20);
        assert!(matches!(
            PeerId::from_hex(&s),
            Err(PeerIdError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_xor_distance_symmetry() {
        let a = peer(0b1010_0000);
        let b = peer(0b0010_0000);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; PEER_ID_LEN]);
    }

    #[test]
    fn test_bucket_index() {
        let a = PeerId::from_bytes([0b1000_0000; PEER_ID_LEN]);
        let b = PeerId::from_bytes([0u8; PEER_ID_LEN]);
        assert_eq!(a.bucket_index(&b), 0);
        assert_eq!(a.bucket_index(&a), 160);
    }

    #[test]
    fn test_cmp_distance_orders_by_proximity() {
        let target = *peer(0).as_bytes();
        let near = peer(1);
        let far = peer(0xF0);
        assert_eq!(cmp_distance(&near, &far, &target), Ordering::Less);
        assert_eq!(cmp_distance(&far, &near, &target), Ordering::Greater);
    }

    #[test]
    fn test_cmp_distance_is_total() {
        // XOR against a fixed target is a bijection, so distinct peers can
        // never tie; equal ids must compare equal for the sort to be stable.
        let target = [0u8; PEER_ID_LEN];
        let c = peer(0x02);
        assert_eq!(cmp_distance(&c, &c, &target), Ordering::Equal);

        let mut peers = vec![peer(9), peer(3), peer(7), peer(1)];
        peers.sort_by(|a, b| cmp_distance(a, b, &target));
        assert_eq!(peers, vec![peer(1), peer(3), peer(7), peer(9)]);
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        assert_eq!(PeerId::from_seed(b"alpha"), PeerId::from_seed(b"alpha"));
        assert_ne!(PeerId::from_seed(b"alpha"), PeerId::from_seed(b"beta"));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = PeerId::from_seed(b"serde");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
