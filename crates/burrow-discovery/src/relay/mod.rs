//! Relaying of handshake and holepunch messages.
//!
//! ## Hops
//!
//! ```text
//! 0 hops:  client --FromClient--> server --Reply--> client
//! 1 hop:   client --FromClient--> relay --FromRelay--> server
//!          server --FromServer--> relay --Reply--> client
//! 2 hops:  client --FromClient--> relay1 --FromSecondRelay--> relay2 --FromRelay--> server
//! ```
//!
//! Each relay overwrites `peer_address` with the sender it observed, so the
//! server learns the client's apparent address and the client learns the
//! server's without either sending the other a packet.

pub mod forwards;
pub mod router;

pub use forwards::{Forward, ForwardConfig, ForwardTable};
pub use router::{HandshakeReply, HolepunchRoute, Router};

use async_trait::async_trait;
use std::net::SocketAddrV4;

/// A server reachable through the router.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    /// Answer a Noise handshake. `peer` is the client as last observed.
    async fn on_handshake(&self, noise: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>>;

    /// Answer a holepunch payload addressed to slot `id`.
    async fn on_holepunch(&self, id: u64, payload: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>>;
}
