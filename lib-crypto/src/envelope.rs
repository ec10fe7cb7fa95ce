//! Authenticated record envelope
//!
//! A sealed value travels as `{ct, iv, mac, epub}`: ciphertext, nonce,
//! AEAD tag, and the ephemeral public key of the sealing operation. All
//! four fields are hex strings so the envelope embeds directly in the
//! JSON-encoded record on the wire.

use crate::keypair::{Keypair, PublicKey};
use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as XPublicKey};
use zeroize::Zeroize;

/// Domain separation for the envelope key derivation.
const ENVELOPE_KDF_CONTEXT: &str = "weft-mesh sealed-envelope v1";

/// Poly1305 tag length in bytes.
const TAG_LEN: usize = 16;

/// A value sealed to a single recipient public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Ciphertext, hex.
    pub ct: String,
    /// 12-byte nonce, hex.
    pub iv: String,
    /// 16-byte Poly1305 tag, hex.
    pub mac: String,
    /// Ephemeral X25519 public key, hex.
    pub epub: String,
}

/// Derive the symmetric envelope key from the DH shared secret and the
/// public transcript (ephemeral key + recipient key).
fn derive_key(shared: &[u8; 32], epub: &[u8; 32], recipient: &[u8; 32]) -> Key {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(shared);
    ikm.extend_from_slice(epub);
    ikm.extend_from_slice(recipient);
    let derived = blake3::derive_key(ENVELOPE_KDF_CONTEXT, &ikm);
    ikm.zeroize();
    *Key::from_slice(&derived)
}

/// Seal `plaintext` for `recipient`.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<SealedEnvelope> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let epub = XPublicKey::from(&ephemeral);
    let recipient_x = XPublicKey::from(*recipient.as_bytes());
    let shared = ephemeral.diffie_hellman(&recipient_x);

    let key = derive_key(shared.as_bytes(), epub.as_bytes(), recipient.as_bytes());
    let cipher = ChaCha20Poly1305::new(&key);

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // Bind the envelope to the recipient so a re-addressed copy fails to open.
    let payload = Payload {
        msg: plaintext,
        aad: recipient.as_bytes(),
    };
    let mut sealed = cipher
        .encrypt(nonce, payload)
        .map_err(|e| anyhow!("envelope seal failed: {}", e))?;

    // The AEAD appends the tag; the wire format carries it separately.
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(SealedEnvelope {
        ct: hex::encode(&sealed),
        iv: hex::encode(nonce_bytes),
        mac: hex::encode(&tag),
        epub: hex::encode(epub.as_bytes()),
    })
}

/// Open an envelope with the recipient's keypair.
pub fn open(envelope: &SealedEnvelope, keypair: &Keypair) -> Result<Vec<u8>> {
    let ct = hex::decode(&envelope.ct).map_err(|e| anyhow!("bad ct hex: {}", e))?;
    let iv = hex::decode(&envelope.iv).map_err(|e| anyhow!("bad iv hex: {}", e))?;
    let mac = hex::decode(&envelope.mac).map_err(|e| anyhow!("bad mac hex: {}", e))?;
    let epub = hex::decode(&envelope.epub).map_err(|e| anyhow!("bad epub hex: {}", e))?;

    if iv.len() != 12 {
        return Err(anyhow!("nonce must be 12 bytes, got {}", iv.len()));
    }
    if mac.len() != TAG_LEN {
        return Err(anyhow!("tag must be {} bytes, got {}", TAG_LEN, mac.len()));
    }
    if epub.len() != 32 {
        return Err(anyhow!("ephemeral key must be 32 bytes, got {}", epub.len()));
    }

    let mut epub_bytes = [0u8; 32];
    epub_bytes.copy_from_slice(&epub);

    let static_secret = x25519_dalek::StaticSecret::from(*keypair.secret.as_bytes());
    let shared = static_secret.diffie_hellman(&XPublicKey::from(epub_bytes));

    let key = derive_key(shared.as_bytes(), &epub_bytes, keypair.public.as_bytes());
    let cipher = ChaCha20Poly1305::new(&key);

    let mut combined = ct;
    combined.extend_from_slice(&mac);

    let payload = Payload {
        msg: &combined,
        aad: keypair.public.as_bytes(),
    };
    cipher
        .decrypt(Nonce::from_slice(&iv), payload)
        .map_err(|_| anyhow!("envelope authentication failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let pair = Keypair::generate();
        let sealed = seal(b"hello overlay", &pair.public).unwrap();
        assert_eq!(open(&sealed, &pair).unwrap(), b"hello overlay");
    }

    #[test]
    fn test_envelope_fields_are_hex() {
        let pair = Keypair::generate();
        let sealed = seal(b"x", &pair.public).unwrap();
        assert_eq!(sealed.iv.len(), 24);
        assert_eq!(sealed.mac.len(), 32);
        assert_eq!(sealed.epub.len(), 64);
        assert!(hex::decode(&sealed.ct).is_ok());
    }

    #[test]
    fn test_tampered_mac_fails() {
        let pair = Keypair::generate();
        let mut sealed = seal(b"payload", &pair.public).unwrap();
        let mut mac = hex::decode(&sealed.mac).unwrap();
        mac[0] ^= 0xFF;
        sealed.mac = hex::encode(mac);
        assert!(open(&sealed, &pair).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let pair = Keypair::generate();
        let mut sealed = seal(b"payload payload", &pair.public).unwrap();
        let mut ct = hex::decode(&sealed.ct).unwrap();
        ct[0] ^= 0x01;
        sealed.ct = hex::encode(ct);
        assert!(open(&sealed, &pair).is_err());
    }

    #[test]
    fn test_envelope_serializes_to_json_object() {
        let pair = Keypair::generate();
        let sealed = seal(b"json", &pair.public).unwrap();
        let value = serde_json::to_value(&sealed).unwrap();
        assert!(value.get("ct").is_some());
        assert!(value.get("iv").is_some());
        assert!(value.get("mac").is_some());
        assert!(value.get("epub").is_some());
        let back: SealedEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, sealed);
    }

    #[test]
    fn test_each_seal_uses_fresh_ephemeral() {
        let pair = Keypair::generate();
        let a = seal(b"same", &pair.public).unwrap();
        let b = seal(b"same", &pair.public).unwrap();
        assert_ne!(a.epub, b.epub);
        assert_ne!(a.ct, b.ct);
    }
}
