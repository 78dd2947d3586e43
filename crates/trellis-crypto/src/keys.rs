//! Key management for Trellis

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

/// Ed25519 keypair for signing nodes and certificates
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Create from seed (deterministic key generation)
    ///
    /// The seed MUST be cryptographically random and kept secret.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Get the 32-byte public key
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Produce a detached 64-byte signature over a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify a detached ed25519 signature
///
/// Returns `false` for bad signatures; `Err` only when the public key bytes
/// are not a valid curve point.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<bool> {
    let verifying =
        VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(signature);
    Ok(verifying.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"Trellis node image";

        let signature = keypair.sign(message);
        assert!(verify(&keypair.public_key(), message, &signature).unwrap());
    }

    #[test]
    fn test_tampered_signature_fails() {
        let keypair = KeyPair::generate();
        let message = b"Trellis node image";

        let mut signature = keypair.sign(message);
        signature[0] ^= 0x01;
        assert!(!verify(&keypair.public_key(), message, &signature).unwrap());
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = KeyPair::from_seed([7u8; 32]);
        let b = KeyPair::from_seed([7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());

        let c = KeyPair::from_seed([8u8; 32]);
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_invalid_public_key_is_error() {
        // All-ones is not a canonical curve point encoding for this check;
        // use a clearly invalid non-canonical value instead.
        let bad = [0xffu8; 32];
        let result = verify(&bad, b"msg", &[0u8; 64]);
        assert!(matches!(result, Err(CryptoError::InvalidPublicKey) | Ok(false)));
    }
}
