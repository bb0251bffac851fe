//! Holepunching.
//!
//! A [`Pair`] owns the sockets of one connection attempt and drives it to a
//! connected raw socket or to failure.
//!
//! ## Rounds
//!
//! ```text
//! client Pair                      relay                      server Pair
//!    |-- Probe {fw, addr, token} ---->|---------------------------->|
//!    |<-- Probe {fw, addr, token, remote_token} -------------------|
//!    |   (both classifications settled, neither pair is double-random)
//!    |-- Punch {token, remote_token} ->|--------------------------->|
//!    |<-- Punch {token, remote_token} ---------------------------- |
//!    |<============== probes over the punched path ==============>|
//! ```
//!
//! ## Strategies
//!
//! | Local | Remote | Strategy |
//! |-------|--------|----------|
//! | consistent | consistent | steady probes to the verified address |
//! | consistent | random | probes to random ports on the remote host |
//! | random | consistent | many sockets, round-robin probes |
//! | random | random | none, aborted in round one |

pub mod pair;
pub mod payload;
mod punch;

pub use pair::{Pair, PairContext, PairState};
pub use payload::{HolepunchCodec, HolepunchPayload, HolepunchStatus};

use crate::error::HolepunchError;
use async_trait::async_trait;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Timing and fan-out of a pair.
#[derive(Debug, Clone)]
pub struct PairConfig {
    /// Round one retries before giving up
    pub max_reopens: usize,
    /// Wait before re-probing a remote that is still unclassified
    pub remote_unknown_wait: Duration,
    /// Upper bound on waiting for the local classification
    pub analyze_timeout: Duration,
    /// Probes sent by the consistent strategy
    pub consistent_tries: usize,
    /// Gap between consistent probes
    pub consistent_interval: Duration,
    /// Head start the initiator gets before the responder probes
    pub responder_delay: Duration,
    /// Probes sprayed at random ports
    pub random_probes: usize,
    /// Gap between random-port probes
    pub random_interval: Duration,
    /// Sockets opened by the birthday strategy
    pub birthday_sockets: usize,
    /// Gap between birthday round-robin probes
    pub birthday_interval: Duration,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            max_reopens: 3,
            remote_unknown_wait: Duration::from_secs(1),
            analyze_timeout: Duration::from_secs(5),
            consistent_tries: 10,
            consistent_interval: Duration::from_secs(1),
            responder_delay: Duration::from_secs(1),
            random_probes: 1750,
            random_interval: Duration::from_millis(20),
            birthday_sockets: 256,
            birthday_interval: Duration::from_millis(20),
        }
    }
}

/// A punched UDP path, handed over to the stream layer.
#[derive(Debug)]
pub struct RawConnection {
    /// Socket now owned by the caller
    pub socket: Arc<UdpSocket>,
    /// Remote endpoint that answered
    pub remote: SocketAddrV4,
    /// Stream frames that arrived before the handover
    pub pending: Vec<Vec<u8>>,
}

/// Reply delivered back through the relay path.
#[derive(Debug, Clone)]
pub struct RelayedReply {
    /// Sealed payload from the remote pair
    pub payload: Vec<u8>,
    /// Remote endpoint as observed by the relay
    pub peer_address: SocketAddrV4,
}

/// Carries sealed payloads to the remote pair.
#[async_trait]
pub trait HolepunchRelay: Send + Sync {
    /// Send `sealed` and wait for the remote pair's reply.
    async fn exchange(&self, sealed: Vec<u8>) -> Result<RelayedReply, HolepunchError>;
}
