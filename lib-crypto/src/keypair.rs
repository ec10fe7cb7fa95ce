//! X25519 keypairs for record sealing

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Public half of a sealing keypair (32 bytes, hex on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub(crate) [u8; 32]);

/// Secret half of a sealing keypair. Never serialized; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(pub(crate) [u8; 32]);

/// An owner's sealing keypair.
#[derive(Clone)]
pub struct Keypair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let decoded = hex::decode(s)?;
        if decoded.len() != 32 {
            anyhow::bail!("public key must be 32 bytes, got {}", decoded.len());
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secret material stays out of logs.
        write!(f, "SecretKey(..)")
    }
}

impl Keypair {
    /// Generate a keypair from the OS entropy source.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_secret_bytes(seed)
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let static_secret = x25519_dalek::StaticSecret::from(secret);
        let public = x25519_dalek::PublicKey::from(&static_secret);
        Self {
            public: PublicKey(*public.as_bytes()),
            secret: SecretKey(secret),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_is_deterministic_from_secret() {
        let a = Keypair::from_secret_bytes([7u8; 32]);
        let b = Keypair::from_secret_bytes([7u8; 32]);
        assert_eq!(a.public, b.public);
    }

    #[test]
    fn test_public_key_hex_round_trip() {
        let pair = Keypair::generate();
        let hex = pair.public.to_hex();
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), pair.public);
    }

    #[test]
    fn test_secret_key_debug_is_redacted() {
        let pair = Keypair::generate();
        assert_eq!(format!("{:?}", pair.secret), "SecretKey(..)");
    }
}
