//! Encrypted holepunch control payloads.
//!
//! ```text
//! [flags:1][status:1][firewall:1][address?:6][remote_address?:6][token?:32][remote_token?:32]
//! ```
//!
//! Flags bit 0..3 mark the optional fields in order. The struct travels
//! sealed under a key derived from the Noise handshake hash, so relays only
//! see ciphertext.

use crate::codec::{CodecError, CodecResult, Decoder, Encoder};
use crate::nat::Firewall;
use burrow_crypto::aead::AeadKey;
use burrow_crypto::hash::keyed_hash;
use burrow_crypto::{CryptoError, Namespaces};
use rand_core::{OsRng, RngCore};
use std::net::{Ipv4Addr, SocketAddrV4};

const HAS_ADDRESS: u8 = 1 << 0;
const HAS_REMOTE_ADDRESS: u8 = 1 << 1;
const HAS_TOKEN: u8 = 1 << 2;
const HAS_REMOTE_TOKEN: u8 = 1 << 3;

/// Phase signalled by a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HolepunchStatus {
    /// Round one: exchange classifications and addresses
    Probe = 0,
    /// Round two: both sides start punching
    Punch = 1,
    /// Sender already holds a connected socket
    Connected = 2,
    /// Sender gives up
    Abort = 3,
}

impl HolepunchStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Probe),
            1 => Some(Self::Punch),
            2 => Some(Self::Connected),
            3 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Plaintext holepunch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolepunchPayload {
    /// Phase
    pub status: HolepunchStatus,
    /// Sender's NAT classification
    pub firewall: Firewall,
    /// Sender's own external address
    pub address: Option<SocketAddrV4>,
    /// Where the sender believes the receiver is
    pub remote_address: Option<SocketAddrV4>,
    /// Sender's token for the receiver's address
    pub token: Option<[u8; 32]>,
    /// Receiver's token, echoed back
    pub remote_token: Option<[u8; 32]>,
}

impl HolepunchPayload {
    /// Payload carrying only a status.
    #[must_use]
    pub fn status(status: HolepunchStatus, firewall: Firewall) -> Self {
        Self {
            status,
            firewall,
            address: None,
            remote_address: None,
            token: None,
            remote_token: None,
        }
    }

    /// Encode to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.address.is_some() {
            flags |= HAS_ADDRESS;
        }
        if self.remote_address.is_some() {
            flags |= HAS_REMOTE_ADDRESS;
        }
        if self.token.is_some() {
            flags |= HAS_TOKEN;
        }
        if self.remote_token.is_some() {
            flags |= HAS_REMOTE_TOKEN;
        }

        let mut enc = Encoder::new();
        enc.u8(flags).u8(self.status as u8).u8(self.firewall as u8);
        if let Some(addr) = self.address {
            enc.address(addr);
        }
        if let Some(addr) = self.remote_address {
            enc.address(addr);
        }
        if let Some(token) = &self.token {
            enc.fixed(token);
        }
        if let Some(token) = &self.remote_token {
            enc.fixed(token);
        }
        enc.finish()
    }

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on truncated input or unknown enum values.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut dec = Decoder::new(bytes);
        let flags = dec.u8()?;
        let status = HolepunchStatus::from_u8(dec.u8()?).ok_or(CodecError::Invalid("status"))?;
        let firewall = Firewall::from_u8(dec.u8()?).ok_or(CodecError::Invalid("firewall"))?;
        let address = if flags & HAS_ADDRESS != 0 {
            Some(dec.address()?)
        } else {
            None
        };
        let remote_address = if flags & HAS_REMOTE_ADDRESS != 0 {
            Some(dec.address()?)
        } else {
            None
        };
        let token = if flags & HAS_TOKEN != 0 {
            Some(dec.fixed()?)
        } else {
            None
        };
        let remote_token = if flags & HAS_REMOTE_TOKEN != 0 {
            Some(dec.fixed()?)
        } else {
            None
        };
        Ok(Self {
            status,
            firewall,
            address,
            remote_address,
            token,
            remote_token,
        })
    }
}

/// Seals and opens the payloads of one pair, and mints address tokens.
pub struct HolepunchCodec {
    key: AeadKey,
    local_secret: [u8; 32],
    namespace: [u8; 32],
}

impl HolepunchCodec {
    /// Codec for the handshake with transcript hash `handshake_hash`.
    #[must_use]
    pub fn new(ns: &Namespaces, handshake_hash: &[u8]) -> Self {
        let mut local_secret = [0u8; 32];
        OsRng.fill_bytes(&mut local_secret);
        Self {
            key: AeadKey::new(ns.holepunch_key(handshake_hash)),
            local_secret,
            namespace: ns.peer_token,
        }
    }

    /// Seal a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn encrypt(&self, payload: &HolepunchPayload) -> Result<Vec<u8>, CryptoError> {
        self.key.seal(&mut OsRng, &payload.encode())
    }

    /// Open a payload. Any authentication or decode failure yields `None`.
    #[must_use]
    pub fn decrypt(&self, sealed: &[u8]) -> Option<HolepunchPayload> {
        let plain = self.key.open(sealed)?;
        HolepunchPayload::decode(&plain).ok()
    }

    /// Token binding `host` to our local secret. Only this pair can mint it,
    /// so a peer echoing it proves it received our message at that host.
    #[must_use]
    pub fn token(&self, host: &Ipv4Addr) -> [u8; 32] {
        keyed_hash(&self.local_secret, &[&self.namespace, &host.octets()])
    }
}

impl std::fmt::Debug for HolepunchCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HolepunchCodec([REDACTED])")
    }
}
