//! NAT models for the socket pool.
//!
//! Loopback delivers every datagram, so scenarios that depend on a NAT
//! dropping traffic install one of these on a node's pool with
//! [`SocketPool::set_filter`](burrow_transport::SocketPool::set_filter).
//! Both models only judge one-byte punch packets; other traffic passes.
//! Short-lived sends open a mapping but never reach the far side.

use burrow_transport::PacketFilter;
use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Endpoints each local socket has sent to.
#[derive(Debug, Default)]
struct Mappings {
    opened: Mutex<HashSet<(SocketAddrV4, SocketAddrV4)>>,
    held_back: AtomicU64,
}

impl Mappings {
    fn open(&self, local: SocketAddrV4, to: SocketAddrV4, ttl: Option<u32>) -> bool {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((local, to));
        if ttl.is_some() {
            self.held_back.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn is_open(&self, local: SocketAddrV4, from: SocketAddrV4) -> bool {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(local, from))
    }
}

/// A NAT with a fresh mapping per destination: a punch packet only gets in
/// on a socket that already sent to its source.
#[derive(Debug, Default)]
pub struct RandomNat {
    mappings: Mappings,
}

impl RandomNat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short-lived sends kept off the wire so far.
    pub fn held_back(&self) -> u64 {
        self.mappings.held_back.load(Ordering::Relaxed)
    }
}

impl PacketFilter for RandomNat {
    fn inbound(&self, local: SocketAddrV4, data: &[u8], from: SocketAddrV4) -> bool {
        data.len() != 1 || self.mappings.is_open(local, from)
    }

    fn outbound(&self, local: SocketAddrV4, to: SocketAddrV4, ttl: Option<u32>) -> bool {
        self.mappings.open(local, to, ttl)
    }
}

/// A consistent NAT that filters unsolicited punch packets, except those
/// whose source port is a multiple of `modulus`. It forwards from a sparse
/// subset of the mappings a random NAT opens towards it.
#[derive(Debug)]
pub struct LossyMapping {
    modulus: u16,
    mappings: Mappings,
    dropped: AtomicU64,
}

impl LossyMapping {
    pub fn new(modulus: u16) -> Self {
        Self {
            modulus: modulus.max(1),
            mappings: Mappings::default(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Whether an unsolicited punch packet from `port` gets through.
    pub fn admits(&self, port: u16) -> bool {
        port % self.modulus == 0
    }

    /// Punch packets dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Short-lived sends kept off the wire so far.
    pub fn held_back(&self) -> u64 {
        self.mappings.held_back.load(Ordering::Relaxed)
    }
}

impl PacketFilter for LossyMapping {
    fn inbound(&self, local: SocketAddrV4, data: &[u8], from: SocketAddrV4) -> bool {
        if data.len() != 1 || self.admits(from.port()) || self.mappings.is_open(local, from) {
            return true;
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    fn outbound(&self, local: SocketAddrV4, to: SocketAddrV4, ttl: Option<u32>) -> bool {
        self.mappings.open(local, to, ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_lossy_mapping_admits_multiples_and_replies() {
        let nat = LossyMapping::new(25);
        let local = addr("127.0.0.1:4000");
        assert!(nat.inbound(local, &[0], addr("127.0.0.1:50000")));
        assert!(!nat.inbound(local, &[0], addr("127.0.0.1:50001")));
        assert!(nat.inbound(local, b"dht message", addr("127.0.0.1:50001")));
        assert_eq!(nat.dropped(), 1);

        assert!(nat.outbound(local, addr("127.0.0.1:50001"), None));
        assert!(nat.inbound(local, &[0], addr("127.0.0.1:50001")));
    }

    #[test]
    fn test_random_nat_needs_an_open_mapping() {
        let nat = RandomNat::new();
        let local = addr("127.0.0.1:4000");
        let remote = addr("127.0.0.1:5000");
        assert!(!nat.inbound(local, &[0], remote));

        assert!(!nat.outbound(local, remote, Some(5)));
        assert_eq!(nat.held_back(), 1);
        assert!(nat.inbound(local, &[0], remote));
        assert!(!nat.inbound(addr("127.0.0.1:4001"), &[0], remote));
    }
}
