//! Initiator side: find the server, handshake through a relay, then dial
//! directly or holepunch.

use crate::error::{NodeError, Result};
use crate::node::{ConnectOptions, NodeContext};
use crate::stream::SecretStream;
use burrow_crypto::{KeyPair, NoiseHandshake, PublicKey};
use burrow_discovery::messages::{HandshakePayload, HandshakeStatus, PROTOCOL_UTP, PROTOCOL_VERSION, PeerRecord};
use burrow_discovery::{Command, Firewall, HandshakeReply, HolepunchRoute, Pair, PairState};
use std::net::SocketAddrV4;
use std::ops::Deref;
use std::sync::Arc;

/// Destroys the pair unless its socket was taken.
struct PairGuard(Pair);

impl Deref for PairGuard {
    type Target = Pair;

    fn deref(&self) -> &Pair {
        &self.0
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

pub(crate) async fn connect(
    ctx: &NodeContext,
    keys: &KeyPair,
    remote: &PublicKey,
    options: &ConnectOptions,
) -> Result<SecretStream> {
    let target = remote.target();
    let candidates = find_peer(ctx, target, remote).await?;
    tracing::debug!("found {} via {:?}", remote, candidates);

    let pair = PairGuard(Pair::new(ctx.pair_context(), true));
    pair.open()?;
    pair.arm_timeout(ctx.config.client.pairing_timeout);

    let mut request = HandshakePayload::new(pair.firewall(), PROTOCOL_UTP);
    if !ctx.dht.firewalled() {
        if let Some(address) = pair.public_address() {
            request.firewall = Firewall::Open;
            request.addresses = vec![address];
        }
    }
    let mut noise = NoiseHandshake::initiator(keys, remote)?;
    let message = noise.send(&request.encode())?;

    let reply = handshake(ctx, target, &candidates, message, options.relay_through).await?;
    let payload = noise
        .recv(&reply.noise)
        .and_then(|plain| HandshakePayload::decode(&plain).ok())
        .ok_or(NodeError::HandshakeInvalid)?;
    check_reply(&payload)?;
    let result = noise.finish()?;
    pair.set_handshake_hash(&result.handshake_hash);
    pair.add_remote_host(*reply.server_address.ip());
    // Covers dialling and both holepunch rounds; punching re-arms it.
    pair.arm_timeout(ctx.config.client.connected_timeout);

    if !payload.addresses.is_empty() {
        tracing::debug!("dialling {} at {:?}", remote, payload.addresses);
        pair.connect(&payload.addresses, payload.pairing);
    } else if !request.addresses.is_empty() {
        tracing::debug!("waiting for {} to dial {:?}", remote, request.addresses);
    } else {
        holepunch(ctx, &pair, target, &reply, &payload, options).await?;
    }

    let raw = pair.wait_connected().await?;
    let stream = SecretStream::new(raw, &result);
    tracing::info!("connected to {} at {}", remote, stream.remote_address());
    Ok(stream)
}

/// First node holding a record for `remote`, followed by the relays it
/// lists.
async fn find_peer(ctx: &NodeContext, target: [u8; 32], remote: &PublicKey) -> Result<Vec<SocketAddrV4>> {
    let mut replies = ctx.dht.query(target, Command::FindPeer, None);
    while let Some(reply) = replies.recv().await {
        let Some(record) = reply.value.as_deref().and_then(|v| PeerRecord::decode(v).ok()) else {
            continue;
        };
        if record.public_key != *remote {
            tracing::trace!("record from {} is for another key", reply.from.addr);
            continue;
        }
        let mut candidates = vec![reply.from.addr];
        for relay in record.relay_addresses {
            if !candidates.contains(&relay) {
                candidates.push(relay);
            }
        }
        return Ok(candidates);
    }
    Err(NodeError::PeerNotFound(target))
}

/// Send the Noise request to each candidate in turn until one answers.
async fn handshake(
    ctx: &NodeContext,
    target: [u8; 32],
    candidates: &[SocketAddrV4],
    message: Vec<u8>,
    relay_through: Option<SocketAddrV4>,
) -> Result<HandshakeReply> {
    let mut last = NodeError::PeerNotFound(target);
    for &relay in candidates {
        let attempt = match relay_through {
            Some(entry) => ctx.router.connect(target, entry, message.clone(), Some(relay)).await,
            None => ctx.router.connect(target, relay, message.clone(), None).await,
        };
        match attempt {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                tracing::debug!("handshake via {} failed: {}", relay, e);
                last = e.into();
            }
        }
    }
    Err(last)
}

fn check_reply(payload: &HandshakePayload) -> Result<()> {
    if payload.version != PROTOCOL_VERSION || payload.status == HandshakeStatus::VersionMismatch {
        return Err(NodeError::ServerIncompatible);
    }
    match payload.status {
        HandshakeStatus::Ok | HandshakeStatus::VersionMismatch => {}
        HandshakeStatus::Aborted => return Err(NodeError::RemoteAborted),
        HandshakeStatus::TryLater => return Err(NodeError::transport("server is busy")),
    }
    if payload.protocols & PROTOCOL_UTP == 0 {
        return Err(NodeError::NoSharedProtocol);
    }
    Ok(())
}

async fn holepunch(
    ctx: &NodeContext,
    pair: &Pair,
    target: [u8; 32],
    reply: &HandshakeReply,
    payload: &HandshakePayload,
    options: &ConnectOptions,
) -> Result<()> {
    let id = payload.holepunch.ok_or(NodeError::RemoteNotHolepunchable)?;
    let route = HolepunchRoute {
        router: Arc::clone(&ctx.router),
        target,
        via: reply.holepunch_via,
        id,
    };

    pair.round_one(&route, reply.server_address).await?;
    if pair.state() == PairState::Connected {
        return Ok(());
    }
    if !options.policy.holepunch(
        pair.remote_firewall(),
        pair.firewall(),
        pair.remote_address(),
        pair.public_address(),
    ) {
        tracing::debug!("policy declined punching towards {}", reply.server_address);
        return Err(NodeError::CannotHolepunch);
    }
    pair.round_two(&route).await?;
    pair.arm_timeout(ctx.config.client.punch_timeout);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_discovery::messages::PROTOCOL_TCP;

    #[test]
    fn test_check_reply() {
        let ok = HandshakePayload::new(Firewall::Open, PROTOCOL_UTP);
        assert!(check_reply(&ok).is_ok());

        let mut old = ok.clone();
        old.version = 0;
        assert_eq!(check_reply(&old), Err(NodeError::ServerIncompatible));

        let mut mismatch = ok.clone();
        mismatch.status = HandshakeStatus::VersionMismatch;
        assert_eq!(check_reply(&mismatch), Err(NodeError::ServerIncompatible));

        let mut aborted = ok.clone();
        aborted.status = HandshakeStatus::Aborted;
        assert_eq!(check_reply(&aborted), Err(NodeError::RemoteAborted));

        let mut busy = ok.clone();
        busy.status = HandshakeStatus::TryLater;
        assert!(check_reply(&busy).unwrap_err().is_transient());

        let tcp_only = HandshakePayload::new(Firewall::Open, PROTOCOL_TCP);
        assert_eq!(check_reply(&tcp_only), Err(NodeError::NoSharedProtocol));
    }
}
