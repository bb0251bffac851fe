//! Transport error types.

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The pool was closed
    #[error("Socket pool is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Only IPv4 is carried on the wire
    #[error("Unsupported address family: {0}")]
    UnsupportedAddress(std::net::SocketAddr),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
