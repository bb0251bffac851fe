//! # Burrow Transport
//!
//! UDP socket management for the Burrow connection pipeline.
//!
//! This crate provides:
//! - A socket pool with reference counted leases and lingering reuse
//! - Per-socket demultiplexing between DHT traffic, holepunch probes,
//!   preconnect notifications and early stream frames
//! - Bulk allocation for birthday-paradox punching
//! - Low-TTL sends for probes that must not travel past the local NAT
//! - A packet filter hook for putting a middlebox model in front of the pool
//!
//! ## Datagram Kinds
//!
//! | Bytes | Kind | Routed to |
//! |-------|------|-----------|
//! | `[0x00]` | holepunch probe | socket's holepunch handler |
//! | `[0xff][id:u32]` | preconnect | one-shot handler registered with `pair(id)` |
//! | `[0xfe]...` | stream frame | socket's holepunch handler, if it claims it |
//! | anything else | DHT message | the pool's datagram sink |
//!
//! A [`PacketFilter`] installed with `set_filter` sees every datagram first
//! and can drop it before any routing happens.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod pool;
pub mod udp;
pub mod wire;

pub use error::{TransportError, TransportResult};
pub use pool::{
    DatagramSink, HolepunchHandler, PacketFilter, PairingGuard, PoolSocket, SocketLease, SocketPool,
};

use std::net::Ipv4Addr;
use std::time::Duration;

/// Socket pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Host new sockets bind to
    pub bind_host: Ipv4Addr,
    /// Sockets kept alive after their last lease is dropped
    pub linger_max: usize,
    /// How long a lingering socket stays open
    pub linger_time: Duration,
    /// TTL for probes that should die just past the local NAT
    pub holepunch_ttl: u32,
    /// TTL restored after a low-TTL send
    pub default_ttl: u32,
    /// Receive buffer size requested from the OS
    pub recv_buffer_size: usize,
    /// Send buffer size requested from the OS
    pub send_buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bind_host: Ipv4Addr::UNSPECIFIED,
            linger_max: 10,
            linger_time: Duration::from_secs(3),
            holepunch_ttl: 5,
            default_ttl: 64,
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
        }
    }
}
