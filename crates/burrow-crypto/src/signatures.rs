//! Ed25519 identities.
//!
//! A node is identified by its Ed25519 public key. The same key pair is used
//! to sign announce records and, converted to X25519, as the static key of
//! the Noise handshake.
//!
//! ## Usage
//!
//! ```ignore
//! use burrow_crypto::KeyPair;
//! use rand_core::OsRng;
//!
//! let keys = KeyPair::generate(&mut OsRng);
//! let signature = keys.sign(b"announce");
//! assert!(keys.public_key().verify(b"announce", &signature).is_ok());
//! ```

use crate::CryptoError;
use crate::hash::{HashOutput, hash};
use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

/// Ed25519 public key, the identity of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Parse and validate a public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a curve point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Parse from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] on wrong length or an invalid point.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// DHT routing key under which this identity's records live.
    #[must_use]
    pub fn target(&self) -> HashOutput {
        hash(&self.0)
    }

    /// X25519 form of the key, as used by the Noise handshake.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the key no longer parses.
    pub fn to_x25519(&self) -> Result<[u8; 32], CryptoError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(key.to_montgomery().to_bytes())
    }

    /// Verify a signature over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if verification fails.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        key.verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Ed25519 key pair. The secret half is zeroized on drop.
#[derive(Clone)]
pub struct KeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random key pair
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Deterministic key pair from a 32-byte seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed. Handle with care.
    #[must_use]
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Public identity
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    /// X25519 private scalar for the Noise static key.
    #[must_use]
    pub fn x25519_secret(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_scalar_bytes())
    }

    /// X25519 public key matching [`KeyPair::x25519_secret`].
    #[must_use]
    pub fn x25519_public(&self) -> [u8; 32] {
        let secret = x25519_dalek::StaticSecret::from(*self.x25519_secret());
        x25519_dalek::PublicKey::from(&secret).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_sign_verify() {
        let keys = KeyPair::generate(&mut OsRng);
        let sig = keys.sign(b"message");
        assert!(keys.public_key().verify(b"message", &sig).is_ok());
        assert_eq!(
            keys.public_key().verify(b"other", &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_from_seed_deterministic() {
        let a = KeyPair::from_seed(&[9u8; 32]);
        let b = KeyPair::from_seed(&[9u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(*a.seed(), [9u8; 32]);
    }

    #[test]
    fn test_x25519_conversion_agrees() {
        let keys = KeyPair::generate(&mut OsRng);
        assert_eq!(keys.public_key().to_x25519().unwrap(), keys.x25519_public());
    }

    #[test]
    fn test_public_key_slice_length() {
        assert_eq!(
            PublicKey::from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidPublicKey)
        );
        let keys = KeyPair::generate(&mut OsRng);
        let pk = PublicKey::from_slice(keys.public_key().as_bytes()).unwrap();
        assert_eq!(pk, keys.public_key());
    }

    #[test]
    fn test_target_is_hash_of_key() {
        let keys = KeyPair::from_seed(&[1u8; 32]);
        let pk = keys.public_key();
        assert_eq!(pk.target(), hash(pk.as_bytes()));
    }
}
