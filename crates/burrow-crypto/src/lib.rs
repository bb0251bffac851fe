//! # Burrow Crypto
//!
//! Cryptographic primitives for the Burrow connection pipeline.
//!
//! This crate provides:
//! - `Noise_IK` handshake wrapper that carries a small payload per message
//! - `XChaCha20-Poly1305` sealing with a prefixed random nonce
//! - Ed25519 identities, convertible to the X25519 keys Noise runs on
//! - BLAKE3 hashing and the namespace table for domain separation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Handshake | Noise IK (25519, ChaChaPoly, BLAKE2b) | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | Signatures | Ed25519 | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod noise;
pub mod signatures;

pub use error::CryptoError;
pub use hash::{HashOutput, Namespaces, hash};
pub use noise::{HandshakeResult, NoiseHandshake};
pub use signatures::{KeyPair, PublicKey, Signature};

/// Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// BLAKE3 output size
pub const HASH_SIZE: usize = 32;

/// Noise handshake hash size (BLAKE2b)
pub const HANDSHAKE_HASH_SIZE: usize = 64;
