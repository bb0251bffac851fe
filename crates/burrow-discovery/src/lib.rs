//! # Burrow Discovery
//!
//! Everything between "I know a public key" and "I hold a punched UDP socket".
//!
//! This crate provides:
//! - NAT classification from DHT-observed addresses
//! - The holepunch [`Pair`] state machine and its sealed payloads
//! - A [`Router`] that relays handshakes and holepunches over 0-2 hops
//! - An [`Announcer`] that keeps a server's record at its closest nodes
//! - The [`Dht`] substrate trait and an in-process [`MemoryNetwork`]
//!
//! ## Pipeline
//!
//! ```text
//! client                           relay                           server
//!   |-- FindPeer ------------------->|                                |
//!   |-- PeerHandshake (Noise) ------>|-- FromRelay ------------------->|
//!   |<------------------------------ |<-- FromServer -----------------|
//!   |-- PeerHolepunch (round one) -->|------------------------------->|
//!   |-- PeerHolepunch (round two) -->|------------------------------->|
//!   |<=================== UDP probes, then stream ==================>|
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod announcer;
pub mod codec;
pub mod dht;
pub mod error;
pub mod holepunch;
pub mod messages;
pub mod nat;
pub mod relay;
pub mod signal;

pub use announcer::{Announcer, AnnouncerConfig, Relay};
pub use dht::memory::{MemoryDht, MemoryNetwork, NatBehavior};
pub use dht::{Command, Dht, DhtSink, IncomingRequest, RequestHandler, RequestOptions};
pub use error::{AnnounceError, DhtError, HolepunchError, RouterError};
pub use holepunch::{
    HolepunchCodec, HolepunchPayload, HolepunchRelay, HolepunchStatus, Pair, PairConfig, PairContext, PairState,
    RawConnection, RelayedReply,
};
pub use nat::{Firewall, NatClassifier, NatConfig};
pub use relay::{ForwardConfig, HandshakeReply, HolepunchRoute, PeerHandler, Router};
pub use signal::{Cancel, CancelToken};
