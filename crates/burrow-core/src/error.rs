//! Error types for the Node API
//!
//! Every way a connection attempt can end short of an open stream maps to
//! one [`NodeError`] variant. Per-packet decode and authentication failures
//! never show up here: they are dropped where they happen.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on a fresh attempt (timeouts, DHT hiccups)
//! - **Permanent**: will not succeed without a change on one side
//!   (incompatible versions, two randomizing NATs, lifecycle misuse)
//!
//! # Example
//!
//! ```no_run
//! use burrow_core::NodeError;
//!
//! fn report(err: &NodeError) {
//!     if err.is_transient() {
//!         println!("{} ({}), try again", err, err.kind());
//!     } else {
//!         println!("giving up: {}", err);
//!     }
//! }
//! ```

use burrow_discovery::{DhtError, HolepunchError, RouterError};
use std::borrow::Cow;
use thiserror::Error;

/// Errors surfaced by [`Node`](crate::Node), [`Server`](crate::Server) and
/// [`SecretStream`](crate::SecretStream)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    // ============ Lookup Errors ============
    /// No node returned a record for the public key
    #[error("Peer not found: {}", hex::encode(&.0[..8]))]
    PeerNotFound([u8; 32]),

    /// The handshake reply was malformed or came from the wrong node
    #[error("Bad handshake reply")]
    BadHandshakeReply,

    /// The holepunch reply was malformed or came from the wrong node
    #[error("Bad holepunch reply")]
    BadHolepunchReply,

    // ============ Holepunch Errors ============
    /// NAT classification did not settle in time
    #[error("Holepunch probe timed out")]
    HolepunchProbeTimeout,

    /// Both peers sit behind port-randomizing NATs
    #[error("Cannot holepunch between two randomized NATs")]
    HolepunchDoubleRandomizedNats,

    /// No punch strategy applies, or the local policy vetoed punching
    #[error("Cannot holepunch")]
    CannotHolepunch,

    /// The server offered neither a holepunch slot nor a direct address
    #[error("Remote is not holepunchable")]
    RemoteNotHolepunchable,

    /// The remote did not switch to punching
    #[error("Remote is not holepunching")]
    RemoteNotHolepunching,

    /// The remote aborted the attempt
    #[error("Remote aborted")]
    RemoteAborted,

    /// The remote never echoed our address token
    #[error("Could not verify remote address")]
    RemoteUnverified,

    /// A peer's address claim contradicts what a relay observed
    #[error("Bad address: {0}")]
    BadAddress(String),

    // ============ Handshake Errors ============
    /// The Noise reply did not authenticate or its payload did not decode
    #[error("Invalid handshake")]
    HandshakeInvalid,

    /// The server speaks another protocol version
    #[error("Server is incompatible")]
    ServerIncompatible,

    /// The peers share no transport protocol
    #[error("No shared transport protocol")]
    NoSharedProtocol,

    // ============ Lifecycle Errors ============
    /// `listen` was called twice on one server
    #[error("Server is already listening")]
    AlreadyListening,

    /// The node was destroyed
    #[error("Node destroyed")]
    NodeDestroyed,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Operational Errors ============
    /// An attempt ran out of time
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Socket failure
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Cryptographic failure outside per-packet authentication
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The DHT substrate failed
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
}

impl NodeError {
    /// Stable machine-readable code for the variant
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::PeerNotFound(_) => "PEER_NOT_FOUND",
            NodeError::BadHandshakeReply => "BAD_HANDSHAKE_REPLY",
            NodeError::BadHolepunchReply => "BAD_HOLEPUNCH_REPLY",
            NodeError::HolepunchProbeTimeout => "HOLEPUNCH_PROBE_TIMEOUT",
            NodeError::HolepunchDoubleRandomizedNats => "HOLEPUNCH_DOUBLE_RANDOMIZED_NATS",
            NodeError::CannotHolepunch => "CANNOT_HOLEPUNCH",
            NodeError::RemoteNotHolepunchable => "REMOTE_NOT_HOLEPUNCHABLE",
            NodeError::RemoteNotHolepunching => "REMOTE_NOT_HOLEPUNCHING",
            NodeError::RemoteAborted => "REMOTE_ABORTED",
            NodeError::RemoteUnverified => "REMOTE_UNVERIFIED",
            NodeError::BadAddress(_) => "BAD_ADDRESS",
            NodeError::HandshakeInvalid => "HANDSHAKE_INVALID",
            NodeError::ServerIncompatible => "SERVER_INCOMPATIBLE",
            NodeError::NoSharedProtocol => "NO_SHARED_PROTOCOL",
            NodeError::AlreadyListening => "ALREADY_LISTENING",
            NodeError::NodeDestroyed => "NODE_DESTROYED",
            NodeError::InvalidState(_) => "INVALID_STATE",
            NodeError::Timeout(_) => "TIMEOUT",
            NodeError::Transport(_) => "TRANSPORT",
            NodeError::Crypto(_) => "CRYPTO",
            NodeError::Dht(_) => "DHT",
        }
    }

    /// Returns true if a fresh attempt may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_)
                | NodeError::Transport(_)
                | NodeError::Dht(_)
                | NodeError::HolepunchProbeTimeout
                | NodeError::BadHandshakeReply
                | NodeError::BadHolepunchReply
        )
    }

    /// Returns true if retrying cannot help without a change on either side
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::ServerIncompatible
                | NodeError::NoSharedProtocol
                | NodeError::HolepunchDoubleRandomizedNats
                | NodeError::CannotHolepunch
                | NodeError::RemoteNotHolepunchable
                | NodeError::AlreadyListening
                | NodeError::NodeDestroyed
                | NodeError::InvalidState(_)
        )
    }

    /// Returns true if the caller should retry with backoff
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient() && !matches!(self, NodeError::Timeout(_))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }
}

impl From<HolepunchError> for NodeError {
    fn from(err: HolepunchError) -> Self {
        match err {
            HolepunchError::ProbeTimeout => NodeError::HolepunchProbeTimeout,
            HolepunchError::DoubleRandomized => NodeError::HolepunchDoubleRandomizedNats,
            HolepunchError::NoStrategy { .. } => NodeError::CannotHolepunch,
            HolepunchError::RemoteAborted => NodeError::RemoteAborted,
            HolepunchError::RemoteNotHolepunching => NodeError::RemoteNotHolepunching,
            HolepunchError::RemoteUnverified => NodeError::RemoteUnverified,
            HolepunchError::AddressMismatch { .. } => NodeError::BadAddress(err.to_string()),
            HolepunchError::BadReply => NodeError::BadHolepunchReply,
            HolepunchError::NotOpen => NodeError::invalid_state("pair is not open"),
            HolepunchError::Timeout => NodeError::timeout("holepunch pairing"),
            HolepunchError::Destroyed => NodeError::NodeDestroyed,
            HolepunchError::Transport(e) => NodeError::Transport(Cow::Owned(e)),
            HolepunchError::Router(e) => e.into(),
        }
    }
}

impl From<RouterError> for NodeError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::BadHandshakeReply => NodeError::BadHandshakeReply,
            RouterError::BadHolepunchReply => NodeError::BadHolepunchReply,
            RouterError::Dht(e) => NodeError::Dht(e),
        }
    }
}

impl From<burrow_crypto::CryptoError> for NodeError {
    fn from(err: burrow_crypto::CryptoError) -> Self {
        NodeError::Crypto(err.to_string())
    }
}

impl From<burrow_transport::TransportError> for NodeError {
    fn from(err: burrow_transport::TransportError) -> Self {
        NodeError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Transport(Cow::Owned(err.to_string()))
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;
