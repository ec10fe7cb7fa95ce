//! Weft crypto capability
//!
//! Private records in the mesh are sealed by their owner before they ever
//! reach the overlay. This crate provides the capability interface the
//! storage layer is handed at construction time, plus the default
//! implementation: ephemeral X25519 key agreement feeding a
//! ChaCha20-Poly1305 envelope.
//!
//! The storage layer never names a concrete implementation; hosts inject
//! whichever [`Crypto`] they want (the default [`SealingCrypto`], or a
//! hardware-backed one).

pub mod envelope;
pub mod keypair;

pub use envelope::SealedEnvelope;
pub use keypair::{Keypair, PublicKey, SecretKey};

use anyhow::Result;

/// The capability handed to the storage engine.
///
/// Implementations must be cheap to share (`Arc<dyn Crypto>`); all methods
/// are synchronous because the default implementation is pure CPU work.
pub trait Crypto: Send + Sync {
    /// Generate a fresh random keypair.
    fn generate_random_pair(&self) -> Result<Keypair>;

    /// Seal `plaintext` so that only the holder of `recipient`'s secret key
    /// can open it.
    fn encrypt_message_with_meta(
        &self,
        plaintext: &[u8],
        recipient: &PublicKey,
    ) -> Result<SealedEnvelope>;

    /// Open an envelope sealed to `keypair.public`.
    ///
    /// Fails if the envelope was sealed for a different key or has been
    /// tampered with.
    fn decrypt_message_with_meta(
        &self,
        envelope: &SealedEnvelope,
        keypair: &Keypair,
    ) -> Result<Vec<u8>>;
}

/// Default [`Crypto`] implementation: X25519 + ChaCha20-Poly1305.
#[derive(Debug, Default, Clone, Copy)]
pub struct SealingCrypto;

impl SealingCrypto {
    pub fn new() -> Self {
        Self
    }
}

impl Crypto for SealingCrypto {
    fn generate_random_pair(&self) -> Result<Keypair> {
        Ok(Keypair::generate())
    }

    fn encrypt_message_with_meta(
        &self,
        plaintext: &[u8],
        recipient: &PublicKey,
    ) -> Result<SealedEnvelope> {
        envelope::seal(plaintext, recipient)
    }

    fn decrypt_message_with_meta(
        &self,
        envelope: &SealedEnvelope,
        keypair: &Keypair,
    ) -> Result<Vec<u8>> {
        envelope::open(envelope, keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_round_trip() {
        let crypto = SealingCrypto::new();
        let pair = crypto.generate_random_pair().unwrap();

        let sealed = crypto
            .encrypt_message_with_meta(b"meshed secret", &pair.public)
            .unwrap();
        let opened = crypto.decrypt_message_with_meta(&sealed, &pair).unwrap();

        assert_eq!(opened, b"meshed secret");
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let crypto = SealingCrypto::new();
        let alice = crypto.generate_random_pair().unwrap();
        let mallory = crypto.generate_random_pair().unwrap();

        let sealed = crypto
            .encrypt_message_with_meta(b"for alice only", &alice.public)
            .unwrap();

        assert!(crypto.decrypt_message_with_meta(&sealed, &mallory).is_err());
    }
}
