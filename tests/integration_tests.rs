//! End-to-end connection scenarios over the in-memory DHT and loopback
//! sockets.

use async_trait::async_trait;
use burrow_core::{ConnectOptions, ConnectionPolicy, Node, NodeError};
use burrow_crypto::{KeyPair, NoiseHandshake, PublicKey};
use burrow_discovery::messages::{HandshakePayload, PROTOCOL_UTP};
use burrow_discovery::{
    Command, Firewall, HolepunchError, HolepunchRelay, HolepunchRoute, NatBehavior, Pair, PairState, RelayedReply,
};
use burrow_integration_tests::fixtures::{LossyMapping, RandomNat, TwoNodeFixture};
use burrow_integration_tests::test_helpers::{eventually, within};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const CONNECT_LIMIT: Duration = Duration::from_secs(15);

/// With the default 256 birthday sockets, the chance that none of them
/// gets through is about 3e-5.
const LOSSY_MODULUS: u16 = 25;

fn holepunch_requests(fixture: &TwoNodeFixture) -> usize {
    fixture
        .net
        .requests()
        .iter()
        .filter(|r| r.command == Command::PeerHolepunch)
        .count()
}

/// Refuses every client at the firewall step.
struct RejectAll {
    seen: AtomicUsize,
}

#[async_trait]
impl ConnectionPolicy for RejectAll {
    async fn firewall(&self, _remote: &PublicKey, _payload: &HandshakePayload, _peer: SocketAddrV4) -> bool {
        self.seen.fetch_add(1, Ordering::SeqCst);
        false
    }
}

/// Admits clients but never punches.
struct NoPunching;

impl ConnectionPolicy for NoPunching {
    fn holepunch(
        &self,
        _remote_firewall: Firewall,
        _local_firewall: Firewall,
        _remote_address: Option<SocketAddrV4>,
        _local_address: Option<SocketAddrV4>,
    ) -> bool {
        false
    }
}

/// Rewrites the relay-observed address of every holepunch reply.
struct TamperedRoute(HolepunchRoute);

#[async_trait]
impl HolepunchRelay for TamperedRoute {
    async fn exchange(&self, sealed: Vec<u8>) -> Result<RelayedReply, HolepunchError> {
        let mut reply = self.0.exchange(sealed).await?;
        reply.peer_address = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), reply.peer_address.port());
        Ok(reply)
    }
}

#[tokio::test]
async fn test_open_nodes_connect_directly() {
    let fixture = TwoNodeFixture::new(NatBehavior::Open, NatBehavior::Open).await.unwrap();
    assert!(fixture.server.address().is_some());

    let (client, server) = within(CONNECT_LIMIT, "direct connect", fixture.establish())
        .await
        .unwrap();

    assert_eq!(client.remote_public_key(), fixture.server_keys.public_key());
    assert_eq!(server.remote_public_key(), fixture.client_keys.public_key());
    assert_eq!(client.handshake_hash(), server.handshake_hash());
    assert!(client.is_initiator());
    assert!(!server.is_initiator());

    client.send(b"hello server").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"hello server");
    server.send(b"hello client").await.unwrap();
    assert_eq!(client.recv().await.unwrap(), b"hello client");

    assert_eq!(holepunch_requests(&fixture), 0);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_consistent_nats_holepunch() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent)
        .await
        .unwrap();
    assert!(fixture.server.address().is_none());

    let (client, server) = within(CONNECT_LIMIT, "holepunch", fixture.establish())
        .await
        .unwrap();
    // Round one and round two both went through the router.
    assert!(holepunch_requests(&fixture) >= 2);

    for i in 0..10u8 {
        client.send(&[i; 64]).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), vec![i; 64]);
    }
    assert!(eventually(Duration::from_secs(2), || fixture.server.pending_attempts() == 0).await);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_random_server_consistent_client() {
    let fixture = TwoNodeFixture::new(NatBehavior::Random, NatBehavior::Consistent)
        .await
        .unwrap();

    let (client, server) = within(CONNECT_LIMIT, "birthday punch", fixture.establish())
        .await
        .unwrap();
    server.send(b"through the birthday sockets").await.unwrap();
    assert_eq!(client.recv().await.unwrap(), b"through the birthday sockets");
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_birthday_punch_through_lossy_nat() {
    let fixture = TwoNodeFixture::new(NatBehavior::Random, NatBehavior::Consistent)
        .await
        .unwrap();
    let server_nat = Arc::new(RandomNat::new());
    let client_nat = Arc::new(LossyMapping::new(LOSSY_MODULUS));
    fixture.server_node.pool().set_filter(Some(server_nat.clone()));
    fixture.client_node.pool().set_filter(Some(client_nat.clone()));

    let (client, server) = within(CONNECT_LIMIT, "lossy birthday punch", fixture.establish())
        .await
        .unwrap();
    assert_eq!(client.remote_address(), server.local_address());
    // Session packets never crossed; the birthday sockets did the work.
    assert!(client_nat.held_back() >= 1);
    let sockets = fixture.config.pair.birthday_sockets as u64;
    assert!(eventually(Duration::from_secs(2), || server_nat.held_back() >= sockets).await);

    server.send(b"one in twenty-five").await.unwrap();
    assert_eq!(client.recv().await.unwrap(), b"one in twenty-five");
    client.send(b"and back").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"and back");
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_random_server_reached_by_port_spray() {
    let fixture = TwoNodeFixture::new(NatBehavior::Random, NatBehavior::Consistent)
        .await
        .unwrap();
    // Nothing unsolicited reaches the client, so only a sprayed guess that
    // lands on one of the server's birthday sockets can open the path.
    let client_nat = Arc::new(LossyMapping::new(u16::MAX));
    fixture.server_node.pool().set_filter(Some(Arc::new(RandomNat::new())));
    fixture.client_node.pool().set_filter(Some(client_nat.clone()));

    let (client, server) = within(CONNECT_LIMIT, "port spray", fixture.establish())
        .await
        .unwrap();
    assert_eq!(client.remote_address(), server.local_address());
    assert!(!client_nat.admits(client.remote_address().port()));

    client.send(b"found you").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"found you");
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_connected_timeout_bounds_holepunch_rounds() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent)
        .await
        .unwrap();
    let mut config = fixture.config.clone();
    config.client.pairing_timeout = Duration::from_secs(30);
    config.client.connected_timeout = Duration::from_millis(300);
    // The client's own classification never settles, so round one keeps
    // waiting on it.
    config.nat.min_samples = 64;
    config.nat.consistent_hits = 64;
    config.nat.classify_after = 64;
    config.nat.random_fallback_after = 64;
    config.pair.analyze_timeout = Duration::from_secs(2);
    config.pair.max_reopens = 10;
    let client = Node::new(fixture.net.add_node(true, NatBehavior::Consistent), config);
    let keys = KeyPair::generate(&mut rand_core::OsRng);

    let started = Instant::now();
    let err = within(
        CONNECT_LIMIT,
        "stalled round one",
        client.connect(&keys, &fixture.server_keys.public_key(), ConnectOptions::default()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, NodeError::Timeout(_)), "unexpected {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(5));

    client.destroy().await;
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_double_random_nats_fail_fast() {
    let fixture = TwoNodeFixture::new(NatBehavior::Random, NatBehavior::Random).await.unwrap();

    let err = within(CONNECT_LIMIT, "double random", fixture.connect())
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::HolepunchDoubleRandomizedNats);
    assert!(err.is_permanent());
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_unknown_key_not_found() {
    let fixture = TwoNodeFixture::new(NatBehavior::Open, NatBehavior::Open).await.unwrap();
    let stranger = KeyPair::from_seed(&[0x42; 32]).public_key();

    let err = fixture
        .client_node
        .connect(&fixture.client_keys, &stranger, ConnectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::PeerNotFound(stranger.target()));
    assert_eq!(err.kind(), "PEER_NOT_FOUND");
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_server_firewall_rejects_silently() {
    let policy = Arc::new(RejectAll {
        seen: AtomicUsize::new(0),
    });
    let shared: Arc<dyn ConnectionPolicy> = policy.clone();
    let fixture = TwoNodeFixture::with_policy(NatBehavior::Open, NatBehavior::Open, Some(shared))
        .await
        .unwrap();

    let err = within(CONNECT_LIMIT, "rejected connect", fixture.connect())
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Dht(_)), "unexpected {:?}", err);
    assert!(policy.seen.load(Ordering::SeqCst) >= 1);
    assert_eq!(fixture.server.pending_attempts(), 0);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_client_policy_declines_punch() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent)
        .await
        .unwrap();
    let options = ConnectOptions {
        policy: Arc::new(NoPunching),
        ..ConnectOptions::default()
    };

    let err = within(CONNECT_LIMIT, "declined punch", fixture.connect_with(options))
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::CannotHolepunch);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_server_policy_aborts_punch() {
    let policy: Arc<dyn ConnectionPolicy> = Arc::new(NoPunching);
    let fixture = TwoNodeFixture::with_policy(NatBehavior::Consistent, NatBehavior::Consistent, Some(policy))
        .await
        .unwrap();

    let err = within(CONNECT_LIMIT, "aborted punch", fixture.connect())
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::RemoteAborted);
    assert!(eventually(Duration::from_secs(2), || fixture.server.pending_attempts() == 0).await);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_connect_through_second_relay() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent)
        .await
        .unwrap();
    let (entry, entry_dht) = fixture.add_node(NatBehavior::Open);
    let options = ConnectOptions {
        relay_through: Some(entry_dht.addr()),
        ..ConnectOptions::default()
    };

    let (client, server) = within(CONNECT_LIMIT, "two-hop connect", async {
        tokio::join!(fixture.connect_with(options), fixture.accept())
    })
    .await;
    let client = client.unwrap();
    let server = server.unwrap();
    assert!(fixture.net.count_requests(entry_dht.addr(), Command::PeerHandshake) >= 1);

    client.send(b"two hops").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"two hops");
    entry.destroy().await;
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_tampered_relay_address_rejected() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent)
        .await
        .unwrap();
    let server_key = fixture.server_keys.public_key();
    let target = server_key.target();
    let relay = fixture.server.relay_addresses()[0];
    let router = Arc::clone(fixture.client_node.router());

    let pair = Pair::new(fixture.client_node.pair_context(), true);
    pair.open().unwrap();
    let mut noise = NoiseHandshake::initiator(&fixture.client_keys, &server_key).unwrap();
    let request = noise
        .send(&HandshakePayload::new(pair.firewall(), PROTOCOL_UTP).encode())
        .unwrap();
    let reply = router.connect(target, relay, request, None).await.unwrap();
    let payload = HandshakePayload::decode(&noise.recv(&reply.noise).unwrap()).unwrap();
    let handshake = noise.finish().unwrap();
    pair.set_handshake_hash(&handshake.handshake_hash);

    let route = TamperedRoute(HolepunchRoute {
        router,
        target,
        via: reply.holepunch_via,
        id: payload.holepunch.unwrap(),
    });
    let err = within(CONNECT_LIMIT, "tampered round one", pair.round_one(&route, reply.server_address))
        .await
        .unwrap_err();
    let err = NodeError::from(err);
    assert!(matches!(err, NodeError::BadAddress(_)), "unexpected {:?}", err);
    assert!(err.to_string().contains("does not agree"));
    assert_eq!(pair.state(), PairState::Destroyed);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_several_clients_one_server() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Open).await.unwrap();
    let server_key = fixture.server_keys.public_key();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (node, _) = fixture.add_node(NatBehavior::Consistent);
        let keys = KeyPair::generate(&mut rand_core::OsRng);
        clients.push((node, keys));
    }

    let connects: Vec<_> = clients
        .iter()
        .map(|(node, keys)| {
            let node = node.clone();
            let keys = keys.clone();
            tokio::spawn(async move { node.connect(&keys, &server_key, ConnectOptions::default()).await })
        })
        .collect();
    let accepted = within(CONNECT_LIMIT, "three accepts", async {
        let mut accepted = Vec::new();
        for _ in 0..3 {
            accepted.push(fixture.accept().await.unwrap());
        }
        accepted
    })
    .await;

    let mut expected: Vec<PublicKey> = clients.iter().map(|(_, keys)| keys.public_key()).collect();
    let mut seen: Vec<PublicKey> = accepted.iter().map(|s| s.remote_public_key()).collect();
    expected.sort_by_key(|k| *k.as_bytes());
    seen.sort_by_key(|k| *k.as_bytes());
    assert_eq!(expected, seen);
    for connect in connects {
        let stream = connect.await.unwrap().unwrap();
        stream.send(b"hi").await.unwrap();
    }

    for (node, _) in clients {
        node.destroy().await;
    }
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_closed_server_is_unreachable() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent)
        .await
        .unwrap();
    let relays = fixture.server.relay_addresses();
    assert!(!relays.is_empty());

    fixture.server.close().await;
    for relay in relays {
        assert!(fixture.net.count_requests(relay, Command::Unannounce) >= 1);
    }
    let err = within(CONNECT_LIMIT, "connect after close", fixture.connect())
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::PeerNotFound(fixture.server_keys.public_key().target()));
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_destroy_interrupts_connect() {
    let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent)
        .await
        .unwrap();
    let client_node = fixture.client_node.clone();
    let keys = fixture.client_keys.clone();
    let server_key = fixture.server_keys.public_key();
    let attempt =
        tokio::spawn(async move { client_node.connect(&keys, &server_key, ConnectOptions::default()).await });

    tokio::time::sleep(Duration::from_millis(5)).await;
    fixture.client_node.destroy().await;
    let result = within(CONNECT_LIMIT, "interrupted connect", attempt).await.unwrap();
    // The connect may have won the race.
    if let Err(err) = result {
        assert_eq!(err, NodeError::NodeDestroyed);
    }
    fixture.cleanup().await;
}
