//! Wire messages of the connection pipeline.
//!
//! | Message | Layout |
//! |---------|--------|
//! | [`ConnectMessage`] | `[flags][mode][noise][peer_address?][relay_address?]` |
//! | [`HolepunchMessage`] | `[flags][mode][id][payload][peer_address?]` |
//! | [`HandshakePayload`] | `[flags][version][status][firewall][protocols][holepunch_id?][addresses?][pairing?]` |
//! | [`PeerRecord`] | `[public_key:32][relay_addresses][timestamp]` |
//! | [`AnnounceMessage`] | `[flags][peer][refresh?:32][signature:64]` |
//!
//! Integers and buffers use the compact encoding from [`crate::codec`].

use crate::codec::{CodecError, CodecResult, Decoder, Encoder};
use crate::nat::Firewall;
use burrow_crypto::hash::keyed_hash;
use burrow_crypto::{PublicKey, Signature};
use std::net::SocketAddrV4;

/// Handshake payload version spoken by this implementation.
pub const PROTOCOL_VERSION: u64 = 1;

/// Transport protocol bit: TCP.
pub const PROTOCOL_TCP: u8 = 1 << 0;

/// Transport protocol bit: UTP.
pub const PROTOCOL_UTP: u8 = 1 << 1;

/// Most relays a record may list.
pub const MAX_RELAY_ADDRESSES: usize = 3;

/// Most direct addresses a handshake payload may carry.
pub const MAX_HANDSHAKE_ADDRESSES: usize = 8;

/// Which leg of a relayed exchange a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Client to first node
    FromClient = 0,
    /// Relay to server
    FromRelay = 1,
    /// First relay to the server's relay
    FromSecondRelay = 2,
    /// Server back to relay
    FromServer = 3,
    /// Final reply to the client
    Reply = 4,
}

impl Mode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::FromClient),
            1 => Some(Self::FromRelay),
            2 => Some(Self::FromSecondRelay),
            3 => Some(Self::FromServer),
            4 => Some(Self::Reply),
            _ => None,
        }
    }
}

fn mode(dec: &mut Decoder<'_>) -> CodecResult<Mode> {
    Mode::from_u8(dec.u8()?).ok_or(CodecError::Invalid("mode"))
}

fn optional_address(dec: &mut Decoder<'_>, present: bool) -> CodecResult<Option<SocketAddrV4>> {
    if present { dec.address().map(Some) } else { Ok(None) }
}

/// Relayed Noise handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMessage {
    /// Leg
    pub mode: Mode,
    /// Noise handshake bytes
    pub noise: Vec<u8>,
    /// Address of the far endpoint as observed by a relay
    pub peer_address: Option<SocketAddrV4>,
    /// Second relay to go through, or the relay that answered
    pub relay_address: Option<SocketAddrV4>,
}

impl ConnectMessage {
    /// Encode to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let flags = u8::from(self.peer_address.is_some()) | u8::from(self.relay_address.is_some()) << 1;
        let mut enc = Encoder::new();
        enc.u8(flags).u8(self.mode as u8).buffer(&self.noise);
        if let Some(addr) = self.peer_address {
            enc.address(addr);
        }
        if let Some(addr) = self.relay_address {
            enc.address(addr);
        }
        enc.finish()
    }

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut dec = Decoder::new(bytes);
        let flags = dec.u8()?;
        let mode = mode(&mut dec)?;
        let noise = dec.buffer()?.to_vec();
        let peer_address = optional_address(&mut dec, flags & 1 != 0)?;
        let relay_address = optional_address(&mut dec, flags & 2 != 0)?;
        Ok(Self {
            mode,
            noise,
            peer_address,
            relay_address,
        })
    }
}

/// Relayed holepunch message. The payload is opaque to relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolepunchMessage {
    /// Leg
    pub mode: Mode,
    /// Server-side slot of the attempt
    pub id: u64,
    /// Sealed holepunch payload
    pub payload: Vec<u8>,
    /// Address of the far endpoint as observed by a relay
    pub peer_address: Option<SocketAddrV4>,
}

impl HolepunchMessage {
    /// Encode to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u8(u8::from(self.peer_address.is_some()))
            .u8(self.mode as u8)
            .uint(self.id)
            .buffer(&self.payload);
        if let Some(addr) = self.peer_address {
            enc.address(addr);
        }
        enc.finish()
    }

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut dec = Decoder::new(bytes);
        let flags = dec.u8()?;
        let mode = mode(&mut dec)?;
        let id = dec.uint()?;
        let payload = dec.buffer()?.to_vec();
        let peer_address = optional_address(&mut dec, flags & 1 != 0)?;
        Ok(Self {
            mode,
            id,
            payload,
            peer_address,
        })
    }
}

/// Outcome signalled in a handshake payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStatus {
    /// Proceed
    Ok = 0,
    /// Server refused
    Aborted = 1,
    /// Version not spoken by the server
    VersionMismatch = 2,
    /// Server is busy
    TryLater = 3,
}

impl HandshakeStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Aborted),
            2 => Some(Self::VersionMismatch),
            3 => Some(Self::TryLater),
            _ => None,
        }
    }
}

/// Application payload carried inside the Noise handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Protocol version
    pub version: u64,
    /// Outcome
    pub status: HandshakeStatus,
    /// Sender's NAT classification
    pub firewall: Firewall,
    /// Supported transport protocols
    pub protocols: u8,
    /// Server slot to address holepunch messages to
    pub holepunch: Option<u64>,
    /// Addresses the sender can be dialled at directly
    pub addresses: Vec<SocketAddrV4>,
    /// Preconnect id to send ahead of dialling
    pub pairing: Option<u32>,
}

impl HandshakePayload {
    /// A payload with status `Ok` and nothing optional.
    #[must_use]
    pub fn new(firewall: Firewall, protocols: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            status: HandshakeStatus::Ok,
            firewall,
            protocols,
            holepunch: None,
            addresses: Vec::new(),
            pairing: None,
        }
    }

    /// Encode to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let flags = u8::from(self.holepunch.is_some())
            | u8::from(!self.addresses.is_empty()) << 1
            | u8::from(self.pairing.is_some()) << 2;
        let mut enc = Encoder::new();
        enc.u8(flags)
            .uint(self.version)
            .u8(self.status as u8)
            .u8(self.firewall as u8)
            .u8(self.protocols);
        if let Some(id) = self.holepunch {
            enc.uint(id);
        }
        if !self.addresses.is_empty() {
            enc.addresses(&self.addresses);
        }
        if let Some(pairing) = self.pairing {
            enc.u32_le(pairing);
        }
        enc.finish()
    }

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut dec = Decoder::new(bytes);
        let flags = dec.u8()?;
        let version = dec.uint()?;
        let status = HandshakeStatus::from_u8(dec.u8()?).ok_or(CodecError::Invalid("status"))?;
        let firewall = Firewall::from_u8(dec.u8()?).ok_or(CodecError::Invalid("firewall"))?;
        let protocols = dec.u8()?;
        let holepunch = if flags & 1 != 0 { Some(dec.uint()?) } else { None };
        let addresses = if flags & 2 != 0 {
            dec.addresses(MAX_HANDSHAKE_ADDRESSES)?
        } else {
            Vec::new()
        };
        let pairing = if flags & 4 != 0 { Some(dec.u32_le()?) } else { None };
        Ok(Self {
            version,
            status,
            firewall,
            protocols,
            holepunch,
            addresses,
            pairing,
        })
    }
}

/// Reachability record of a server, stored at its relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Server identity
    pub public_key: PublicKey,
    /// Nodes that forward to the server
    pub relay_addresses: Vec<SocketAddrV4>,
    /// Seconds since the Unix epoch at signing
    pub timestamp: u64,
}

impl PeerRecord {
    /// Encode to bytes. At most [`MAX_RELAY_ADDRESSES`] relays are written.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let relays = &self.relay_addresses[..self.relay_addresses.len().min(MAX_RELAY_ADDRESSES)];
        Encoder::new()
            .fixed(self.public_key.as_bytes())
            .addresses(relays)
            .uint(self.timestamp)
            .finish()
    }

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input or too many relays.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut dec = Decoder::new(bytes);
        Self::decode_from(&mut dec)
    }

    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        let key: [u8; 32] = dec.fixed()?;
        let public_key = PublicKey::from_bytes(key).map_err(|_| CodecError::Invalid("public key"))?;
        let relay_addresses = dec.addresses(MAX_RELAY_ADDRESSES)?;
        let timestamp = dec.uint()?;
        Ok(Self {
            public_key,
            relay_addresses,
            timestamp,
        })
    }
}

/// Signed announce or unannounce request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceMessage {
    /// The record
    pub peer: PeerRecord,
    /// Refresh token, when renewing
    pub refresh: Option<[u8; 32]>,
    /// Signature over [`signable`]
    pub signature: Signature,
}

impl AnnounceMessage {
    /// Encode to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u8(u8::from(self.refresh.is_some()))
            .buffer(&self.peer.encode());
        if let Some(refresh) = &self.refresh {
            enc.fixed(refresh);
        }
        enc.fixed(self.signature.as_bytes());
        enc.finish()
    }

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut dec = Decoder::new(bytes);
        let flags = dec.u8()?;
        let peer = PeerRecord::decode(dec.buffer()?)?;
        let refresh = if flags & 1 != 0 { Some(dec.fixed()?) } else { None };
        let signature = Signature::from_bytes(dec.fixed()?);
        Ok(Self {
            peer,
            refresh,
            signature,
        })
    }
}

/// Bytes an announce signature covers, hashed under `namespace`.
///
/// Binding the responder's id and write token stops a record signed for one
/// node from being replayed to another.
#[must_use]
pub fn signable(
    namespace: &[u8; 32],
    target: &[u8; 32],
    token: &[u8; 32],
    responder_id: &[u8; 32],
    peer: &[u8],
    refresh: Option<&[u8; 32]>,
) -> [u8; 32] {
    keyed_hash(
        namespace,
        &[target, token, responder_id, peer, refresh.map_or(&[][..], |r| &r[..])],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_crypto::KeyPair;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_connect_layout() {
        let msg = ConnectMessage {
            mode: Mode::FromRelay,
            noise: vec![9; 3],
            peer_address: Some(addr("1.2.3.4:80")),
            relay_address: None,
        };
        let bytes = msg.encode();
        assert_eq!(bytes, vec![1, 1, 3, 9, 9, 9, 1, 2, 3, 4, 0, 80]);
        assert_eq!(ConnectMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_connect_rejects_unknown_mode() {
        assert!(ConnectMessage::decode(&[0, 7, 0]).is_err());
        assert!(ConnectMessage::decode(&[1, 0, 0]).is_err());
    }

    #[test]
    fn test_holepunch_message() {
        let msg = HolepunchMessage {
            mode: Mode::FromClient,
            id: 300,
            payload: vec![1, 2, 3],
            peer_address: None,
        };
        let bytes = msg.encode();
        assert_eq!(&bytes[..5], &[0, 0, 0xfd, 0x2c, 0x01]);
        assert_eq!(HolepunchMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_handshake_payload_optionals() {
        let mut payload = HandshakePayload::new(Firewall::Open, PROTOCOL_TCP | PROTOCOL_UTP);
        assert_eq!(HandshakePayload::decode(&payload.encode()).unwrap(), payload);

        payload.holepunch = Some(4);
        payload.addresses = vec![addr("10.0.0.1:1000")];
        payload.pairing = Some(0xdead_beef);
        payload.status = HandshakeStatus::TryLater;
        assert_eq!(HandshakePayload::decode(&payload.encode()).unwrap(), payload);
    }

    #[test]
    fn test_peer_record_relay_limit() {
        let keys = KeyPair::from_seed(&[3u8; 32]);
        let record = PeerRecord {
            public_key: keys.public_key(),
            relay_addresses: vec![addr("1.1.1.1:1"); 5],
            timestamp: 1_700_000_000,
        };
        let decoded = PeerRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.relay_addresses.len(), MAX_RELAY_ADDRESSES);

        let oversized = Encoder::new()
            .fixed(keys.public_key().as_bytes())
            .addresses(&[addr("1.1.1.1:1"); 4])
            .uint(0)
            .finish();
        assert!(PeerRecord::decode(&oversized).is_err());
    }

    #[test]
    fn test_announce_signature_binding() {
        let keys = KeyPair::from_seed(&[4u8; 32]);
        let peer = PeerRecord {
            public_key: keys.public_key(),
            relay_addresses: vec![],
            timestamp: 1,
        };
        let target = keys.public_key().target();
        let ns = [5u8; 32];
        let message = signable(&ns, &target, &[1u8; 32], &[2u8; 32], &peer.encode(), None);
        let announce = AnnounceMessage {
            signature: keys.sign(&message),
            peer: peer.clone(),
            refresh: Some([6u8; 32]),
        };
        let decoded = AnnounceMessage::decode(&announce.encode()).unwrap();
        assert_eq!(decoded, announce);

        let other_node = signable(&ns, &target, &[1u8; 32], &[3u8; 32], &peer.encode(), None);
        assert!(keys.public_key().verify(&message, &decoded.signature).is_ok());
        assert!(keys.public_key().verify(&other_node, &decoded.signature).is_err());
    }
}
