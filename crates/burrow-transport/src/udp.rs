//! Socket creation.

use crate::{PoolConfig, TransportError, TransportResult};
use std::net::SocketAddrV4;
use tokio::net::UdpSocket;

/// Bind a non-blocking UDP socket on `addr` and register it with Tokio.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
pub fn bind(addr: SocketAddrV4, config: &PoolConfig) -> TransportResult<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    // Buffer sizes are advisory; some platforms clamp them.
    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
        tracing::trace!("recv buffer size not applied: {e}");
    }
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
        tracing::trace!("send buffer size not applied: {e}");
    }

    socket
        .bind(&std::net::SocketAddr::V4(addr).into())
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| TransportError::BindFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let socket = bind(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            &PoolConfig::default(),
        )
        .unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
