//! Application hooks that can refuse a connection.

use async_trait::async_trait;
use burrow_crypto::PublicKey;
use burrow_discovery::Firewall;
use burrow_discovery::messages::HandshakePayload;
use std::net::SocketAddrV4;

/// Decides which peers get a connection.
///
/// Both methods default to allowing everything.
#[async_trait]
pub trait ConnectionPolicy: Send + Sync {
    /// Server side: admit a client after its Noise request authenticated.
    /// Returning `false` drops the attempt without a reply.
    async fn firewall(&self, _remote: &PublicKey, _payload: &HandshakePayload, _peer: SocketAddrV4) -> bool {
        true
    }

    /// Either side: allow punching once both classifications are known.
    fn holepunch(
        &self,
        _remote_firewall: Firewall,
        _local_firewall: Firewall,
        _remote_address: Option<SocketAddrV4>,
        _local_address: Option<SocketAddrV4>,
    ) -> bool {
        true
    }
}

/// Admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectionPolicy for AllowAll {}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_crypto::KeyPair;
    use burrow_discovery::messages::PROTOCOL_UTP;

    #[tokio::test]
    async fn test_allow_all() {
        let policy = AllowAll;
        let payload = HandshakePayload::new(Firewall::Open, PROTOCOL_UTP);
        let key = KeyPair::from_seed(&[1; 32]).public_key();
        assert!(policy.firewall(&key, &payload, "1.2.3.4:5".parse().unwrap()).await);
        assert!(policy.holepunch(Firewall::Random, Firewall::Consistent, None, None));
    }
}
