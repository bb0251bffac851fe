//! Discovery error types.

use std::net::SocketAddrV4;
use thiserror::Error;

/// Failures reported by the DHT substrate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// No reply arrived in time
    #[error("request timed out")]
    Timeout,

    /// The destination is not reachable
    #[error("node {0} is unreachable")]
    Unreachable(SocketAddrV4),

    /// The request token was missing or stale
    #[error("invalid request token")]
    InvalidToken,

    /// The local DHT node has shut down
    #[error("dht destroyed")]
    Destroyed,

    /// Anything else the substrate reports
    #[error("dht error: {0}")]
    Other(String),
}

/// Failures of relayed `connect` / `holepunch` exchanges.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The handshake reply came from the wrong address or was malformed
    #[error("bad handshake reply")]
    BadHandshakeReply,

    /// The holepunch reply came from the wrong address or was malformed
    #[error("bad holepunch reply")]
    BadHolepunchReply,

    /// The underlying request failed
    #[error(transparent)]
    Dht(#[from] DhtError),
}

/// Failures of a holepunch attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HolepunchError {
    /// NAT classification did not settle within the reopen budget
    #[error("holepunch probe timed out")]
    ProbeTimeout,

    /// Both sides sit behind port-randomizing NATs
    #[error("cannot holepunch between two randomized NATs")]
    DoubleRandomized,

    /// No punch strategy exists for this pair of classifications
    #[error("cannot holepunch from {local} to {remote}")]
    NoStrategy {
        /// Local classification
        local: crate::Firewall,
        /// Remote classification
        remote: crate::Firewall,
    },

    /// The remote answered with an abort
    #[error("remote aborted the holepunch")]
    RemoteAborted,

    /// The remote did not switch to punching
    #[error("remote is not holepunching")]
    RemoteNotHolepunching,

    /// The remote did not echo our address token
    #[error("could not verify remote address")]
    RemoteUnverified,

    /// A peer's own address claim contradicts what the relay observed
    #[error("remote address {claimed} does not agree with relay-observed {observed}")]
    AddressMismatch {
        /// Address the peer claims
        claimed: SocketAddrV4,
        /// Address the relay saw
        observed: SocketAddrV4,
    },

    /// Reply could not be decrypted or decoded
    #[error("bad holepunch reply")]
    BadReply,

    /// The pair has no socket or no handshake key yet
    #[error("pair is not open")]
    NotOpen,

    /// The pairing timer fired
    #[error("pairing timed out")]
    Timeout,

    /// The pair was torn down
    #[error("pair destroyed")]
    Destroyed,

    /// Socket failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Relay failure
    #[error(transparent)]
    Router(#[from] RouterError),
}

impl From<burrow_transport::TransportError> for HolepunchError {
    fn from(err: burrow_transport::TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Failures of one announce cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnnounceError {
    /// The lookup returned no node that accepted the record
    #[error("no relay accepted the announce")]
    NoRelays,

    /// The announcer was stopped
    #[error("announcer stopped")]
    Stopped,
}
