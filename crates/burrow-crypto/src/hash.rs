//! BLAKE3 hashing and domain separation.
//!
//! Every signature and encryption context in Burrow hashes its inputs under
//! a distinct namespace key. The keys are derived once into a [`Namespaces`]
//! table which callers hold and pass down explicitly.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Hash the concatenation of several inputs without copying them together.
#[must_use]
pub fn hash_parts(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Keyed BLAKE3 over several inputs.
#[must_use]
pub fn keyed_hash(key: &[u8; 32], parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new_keyed(key);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

const ANNOUNCE_CONTEXT: &str = "burrow 2024-06 announce signature";
const UNANNOUNCE_CONTEXT: &str = "burrow 2024-06 unannounce signature";
const HOLEPUNCH_CONTEXT: &str = "burrow 2024-06 holepunch payload key";
const PEER_TOKEN_CONTEXT: &str = "burrow 2024-06 peer address token";

/// Domain separation keys, one per signing or encryption purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
    /// Announce record signatures
    pub announce: [u8; 32],
    /// Unannounce record signatures
    pub unannounce: [u8; 32],
    /// Holepunch payload key derivation
    pub holepunch: [u8; 32],
    /// Address-bound anti-spoofing tokens
    pub peer_token: [u8; 32],
}

impl Namespaces {
    /// Derive the table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            announce: blake3::derive_key(ANNOUNCE_CONTEXT, b""),
            unannounce: blake3::derive_key(UNANNOUNCE_CONTEXT, b""),
            holepunch: blake3::derive_key(HOLEPUNCH_CONTEXT, b""),
            peer_token: blake3::derive_key(PEER_TOKEN_CONTEXT, b""),
        }
    }

    /// Shared secret for the holepunch payloads of one handshake.
    #[must_use]
    pub fn holepunch_key(&self, handshake_hash: &[u8]) -> [u8; 32] {
        keyed_hash(&self.holepunch, &[handshake_hash])
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::new()
    }
}
