//! Noise IK handshake wrapper.
//!
//! Drives one `Noise_IK_25519_ChaChaPoly_BLAKE2b` handshake and carries a small
//! application payload in each of its two messages. The initiator knows the
//! responder's identity up front; the responder learns the initiator's from
//! the first message.
//!
//! Each payload is prefixed with the sender's Ed25519 public key. On receive
//! the prefix is checked against the Noise remote static key, so a completed
//! handshake reports Ed25519 identities on both sides.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                          Responder
//!     |  -> e, es, s, ss  [payload]      |
//!     |--------------------------------->|  recv() -> payload
//!     |  <- e, ee, se     [payload]      |  send()  -> split
//!     |<---------------------------------|
//! recv() -> payload, split               |
//! ```

use crate::signatures::{KeyPair, PublicKey};
use crate::{CryptoError, HANDSHAKE_HASH_SIZE, PUBLIC_KEY_SIZE};
use zeroize::ZeroizeOnDrop;

/// Noise protocol name.
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2b";

/// Largest Noise message.
const MAX_MESSAGE_SIZE: usize = 65535;

/// Upper bound on IK handshake overhead (ephemeral, static, two tags).
const HANDSHAKE_OVERHEAD: usize = 32 + 48 + 16;

/// Output of a completed handshake.
#[derive(Clone, ZeroizeOnDrop)]
pub struct HandshakeResult {
    /// Our identity
    #[zeroize(skip)]
    pub public_key: PublicKey,
    /// Authenticated identity of the other side
    #[zeroize(skip)]
    pub remote_public_key: PublicKey,
    /// Key for data we send
    pub tx: [u8; 32],
    /// Key for data we receive
    pub rx: [u8; 32],
    /// Transcript hash, shared by both sides
    pub handshake_hash: [u8; HANDSHAKE_HASH_SIZE],
    /// Whether we initiated
    #[zeroize(skip)]
    pub is_initiator: bool,
}

impl std::fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("public_key", &self.public_key)
            .field("remote_public_key", &self.remote_public_key)
            .field("is_initiator", &self.is_initiator)
            .finish_non_exhaustive()
    }
}

/// Single-use IK handshake.
pub struct NoiseHandshake {
    state: snow::HandshakeState,
    public_key: PublicKey,
    remote_public_key: Option<PublicKey>,
    result: Option<HandshakeResult>,
}

impl NoiseHandshake {
    /// Start a handshake towards `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote key is invalid or snow rejects the keys.
    pub fn initiator(keypair: &KeyPair, remote: &PublicKey) -> Result<Self, CryptoError> {
        let remote_static = remote.to_x25519()?;
        let secret = keypair.x25519_secret();
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e: snow::Error| CryptoError::Handshake(e.to_string()))?;
        let state = snow::Builder::new(params)
            .local_private_key(&secret[..])
            .remote_public_key(&remote_static)
            .build_initiator()?;

        Ok(Self {
            state,
            public_key: keypair.public_key(),
            remote_public_key: Some(*remote),
            result: None,
        })
    }

    /// Wait for a handshake from anyone.
    ///
    /// # Errors
    ///
    /// Returns an error if snow rejects the local key.
    pub fn responder(keypair: &KeyPair) -> Result<Self, CryptoError> {
        let secret = keypair.x25519_secret();
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e: snow::Error| CryptoError::Handshake(e.to_string()))?;
        let state = snow::Builder::new(params)
            .local_private_key(&secret[..])
            .build_responder()?;

        Ok(Self {
            state,
            public_key: keypair.public_key(),
            remote_public_key: None,
            result: None,
        })
    }

    /// Whether this side started the handshake.
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.state.is_initiator()
    }

    /// Whether the split has happened.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    /// Remote identity, once known.
    #[must_use]
    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote_public_key
    }

    /// Write the next handshake message carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns an error if it is not our turn, the handshake is finished,
    /// or the payload does not fit a Noise message.
    pub fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.result.is_some() {
            return Err(CryptoError::InvalidState("handshake already complete"));
        }
        let mut framed = Vec::with_capacity(PUBLIC_KEY_SIZE + payload.len());
        framed.extend_from_slice(self.public_key.as_bytes());
        framed.extend_from_slice(payload);

        let size = framed.len() + HANDSHAKE_OVERHEAD;
        if size > MAX_MESSAGE_SIZE {
            return Err(CryptoError::Handshake("payload too large".into()));
        }
        let mut message = vec![0u8; size];
        let len = self.state.write_message(&framed, &mut message)?;
        message.truncate(len);

        self.maybe_split()?;
        Ok(message)
    }

    /// Read the next handshake message and return its payload.
    ///
    /// Any failure (bad authentication, wrong turn, malformed input, an
    /// identity that does not match the Noise static key) yields `None`.
    pub fn recv(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        if self.result.is_some() || message.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        let mut framed = vec![0u8; message.len()];
        let len = self.state.read_message(message, &mut framed).ok()?;
        framed.truncate(len);

        if framed.len() < PUBLIC_KEY_SIZE {
            return None;
        }
        let claimed = PublicKey::from_slice(&framed[..PUBLIC_KEY_SIZE]).ok()?;
        let remote_static = self.state.get_remote_static()?;
        if claimed.to_x25519().ok()?.as_slice() != remote_static {
            return None;
        }
        if self.remote_public_key.is_some_and(|expected| expected != claimed) {
            return None;
        }
        self.remote_public_key = Some(claimed);

        self.maybe_split().ok()?;
        Some(framed.split_off(PUBLIC_KEY_SIZE))
    }

    /// Handshake output.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if called before the split. That
    /// is a caller bug, not a network condition.
    pub fn finish(&self) -> Result<HandshakeResult, CryptoError> {
        self.result
            .clone()
            .ok_or(CryptoError::InvalidState("handshake not complete"))
    }

    fn maybe_split(&mut self) -> Result<(), CryptoError> {
        if !self.state.is_handshake_finished() {
            return Ok(());
        }
        let remote_public_key = self
            .remote_public_key
            .ok_or(CryptoError::InvalidState("remote identity unknown"))?;

        let mut handshake_hash = [0u8; HANDSHAKE_HASH_SIZE];
        let hash = self.state.get_handshake_hash();
        if hash.len() != HANDSHAKE_HASH_SIZE {
            return Err(CryptoError::InvalidState("unexpected handshake hash size"));
        }
        handshake_hash.copy_from_slice(hash);

        let is_initiator = self.state.is_initiator();
        let (initiator_to_responder, responder_to_initiator) =
            self.state.dangerously_get_raw_split();
        let (tx, rx) = if is_initiator {
            (initiator_to_responder, responder_to_initiator)
        } else {
            (responder_to_initiator, initiator_to_responder)
        };

        self.result = Some(HandshakeResult {
            public_key: self.public_key,
            remote_public_key,
            tx,
            rx,
            handshake_hash,
            is_initiator,
        });
        Ok(())
    }
}

impl std::fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseHandshake")
            .field("initiator", &self.is_initiator())
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}
