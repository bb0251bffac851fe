//! Router: the node-side request handler for the connection pipeline.
//!
//! Serves `PeerHandshake` and `PeerHolepunch` for local servers, forwards
//! them for servers that announced to us, and stores those announces.

use super::{Forward, ForwardConfig, ForwardTable, PeerHandler};
use crate::dht::{Command, Dht, IncomingRequest, RequestHandler, RequestOptions, Response};
use crate::error::{HolepunchError, RouterError};
use crate::holepunch::{HolepunchRelay, RelayedReply};
use crate::messages::{AnnounceMessage, ConnectMessage, HolepunchMessage, Mode, PeerRecord, signable};
use async_trait::async_trait;
use burrow_crypto::Namespaces;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome of a relayed handshake, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    /// Server's Noise reply
    pub noise: Vec<u8>,
    /// Server address as observed by the last relay, or the answering node
    pub server_address: SocketAddrV4,
    /// Our address as observed by the node we asked
    pub client_address: SocketAddrV4,
    /// Whether the server sat behind at least one relay
    pub relayed: bool,
    /// Node to send holepunch messages to
    pub holepunch_via: SocketAddrV4,
}

/// Routes handshake and holepunch messages between clients and servers.
pub struct Router {
    dht: Arc<dyn Dht>,
    ns: Arc<Namespaces>,
    forwards: Mutex<ForwardTable>,
}

impl Router {
    /// New router over `dht`. It still has to be installed with
    /// [`Dht::set_handler`].
    #[must_use]
    pub fn new(dht: Arc<dyn Dht>, ns: Arc<Namespaces>, config: ForwardConfig) -> Arc<Self> {
        Arc::new(Self {
            dht,
            ns,
            forwards: Mutex::new(ForwardTable::new(config)),
        })
    }

    fn table(&self) -> MutexGuard<'_, ForwardTable> {
        self.forwards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forward(&self, target: &[u8; 32]) -> Option<Forward> {
        self.table().get(target).cloned()
    }

    /// Serve `target` from this node.
    pub fn set_local(&self, target: [u8; 32], handler: Arc<dyn PeerHandler>) {
        self.table().set_local(target, handler);
    }

    /// Publish the record a local server announced.
    pub fn set_local_record(&self, target: &[u8; 32], record: PeerRecord) {
        self.table().set_local_record(target, record);
    }

    /// Stop serving `target`.
    pub fn remove_local(&self, target: &[u8; 32]) -> bool {
        self.table().remove_local(target)
    }

    /// Record stored for `target`, if any.
    #[must_use]
    pub fn record(&self, target: &[u8; 32]) -> Option<PeerRecord> {
        self.table().get(target).and_then(Forward::record).cloned()
    }

    /// Whether announces for `target` are being relayed by this node.
    #[must_use]
    pub fn is_relaying(&self, target: &[u8; 32]) -> bool {
        matches!(self.table().get(target), Some(Forward::Relayed { .. }))
    }

    /// Drop expired forwards.
    pub fn cleanup(&self) -> usize {
        self.table().cleanup()
    }

    /// Send a Noise request towards the server of `target` via `to`.
    ///
    /// `relay_through` names the server's relay when `to` does not hold
    /// the forward itself.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BadHandshakeReply`] if the reply is malformed
    /// or comes from another address than `to`.
    pub async fn connect(
        &self,
        target: [u8; 32],
        to: SocketAddrV4,
        noise: Vec<u8>,
        relay_through: Option<SocketAddrV4>,
    ) -> Result<HandshakeReply, RouterError> {
        let request = ConnectMessage {
            mode: Mode::FromClient,
            noise,
            peer_address: None,
            relay_address: relay_through,
        };
        let res = self
            .dht
            .request(Some(target), Command::PeerHandshake, Some(request.encode()), to, RequestOptions::default())
            .await?;
        if res.from.addr != to {
            tracing::warn!("handshake reply from {} but sent to {}", res.from.addr, to);
            return Err(RouterError::BadHandshakeReply);
        }
        let reply = res
            .value
            .as_deref()
            .and_then(|v| ConnectMessage::decode(v).ok())
            .filter(|m| m.mode == Mode::Reply)
            .ok_or(RouterError::BadHandshakeReply)?;

        Ok(HandshakeReply {
            noise: reply.noise,
            server_address: reply.peer_address.unwrap_or(res.from.addr),
            client_address: res.to,
            relayed: reply.peer_address.is_some(),
            holepunch_via: reply.relay_address.unwrap_or(to),
        })
    }

    /// Send a sealed holepunch payload to slot `id` of the server of `target`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BadHolepunchReply`] if the reply is malformed
    /// or comes from another address than `to`.
    pub async fn holepunch(
        &self,
        target: [u8; 32],
        to: SocketAddrV4,
        id: u64,
        payload: Vec<u8>,
    ) -> Result<RelayedReply, RouterError> {
        let request = HolepunchMessage {
            mode: Mode::FromClient,
            id,
            payload,
            peer_address: None,
        };
        let res = self
            .dht
            .request(Some(target), Command::PeerHolepunch, Some(request.encode()), to, RequestOptions::default())
            .await?;
        if res.from.addr != to {
            tracing::warn!("holepunch reply from {} but sent to {}", res.from.addr, to);
            return Err(RouterError::BadHolepunchReply);
        }
        let reply = res
            .value
            .as_deref()
            .and_then(|v| HolepunchMessage::decode(v).ok())
            .filter(|m| m.mode == Mode::Reply)
            .ok_or(RouterError::BadHolepunchReply)?;

        Ok(RelayedReply {
            payload: reply.payload,
            peer_address: reply.peer_address.unwrap_or(res.from.addr),
        })
    }

    /// Forward one leg and insist the answer comes from where we sent it.
    async fn relay(&self, target: [u8; 32], command: Command, value: Vec<u8>, to: SocketAddrV4) -> Option<Response> {
        let res = match self
            .dht
            .request(Some(target), command, Some(value), to, RequestOptions::default())
            .await
        {
            Ok(res) => res,
            Err(e) => {
                tracing::debug!("forward {:?} to {} failed: {}", command, to, e);
                return None;
            }
        };
        if res.from.addr != to {
            tracing::warn!("forwarded reply from {} but sent to {}", res.from.addr, to);
            return None;
        }
        Some(res)
    }

    async fn on_connect(&self, req: IncomingRequest) -> Option<Vec<u8>> {
        let target = req.target?;
        let msg = ConnectMessage::decode(req.value.as_deref()?).ok()?;
        let forward = self.forward(&target);

        let reply = match (msg.mode, forward) {
            (Mode::FromClient, Some(Forward::Local { handler, .. })) => ConnectMessage {
                mode: Mode::Reply,
                noise: handler.on_handshake(msg.noise, req.from).await?,
                peer_address: None,
                relay_address: None,
            },
            (Mode::FromClient, Some(Forward::Relayed { relay, .. })) => {
                tracing::trace!("relaying handshake from {} to {}", req.from, relay);
                let leg = ConnectMessage {
                    mode: Mode::FromRelay,
                    noise: msg.noise,
                    peer_address: Some(req.from),
                    relay_address: None,
                };
                let res = self.relay(target, Command::PeerHandshake, leg.encode(), relay).await?;
                let back = decode_connect(&res, Mode::FromServer)?;
                ConnectMessage {
                    mode: Mode::Reply,
                    noise: back.noise,
                    peer_address: Some(res.from.addr),
                    relay_address: None,
                }
            }
            (Mode::FromClient, None) => {
                let via = msg.relay_address?;
                tracing::trace!("second-hop handshake from {} via {}", req.from, via);
                let leg = ConnectMessage {
                    mode: Mode::FromSecondRelay,
                    noise: msg.noise,
                    peer_address: Some(req.from),
                    relay_address: None,
                };
                let res = self.relay(target, Command::PeerHandshake, leg.encode(), via).await?;
                let back = decode_connect(&res, Mode::FromServer)?;
                ConnectMessage {
                    mode: Mode::Reply,
                    noise: back.noise,
                    peer_address: Some(back.peer_address?),
                    relay_address: Some(res.from.addr),
                }
            }
            (Mode::FromRelay, Some(Forward::Local { handler, .. })) => ConnectMessage {
                mode: Mode::FromServer,
                noise: handler.on_handshake(msg.noise, msg.peer_address?).await?,
                peer_address: None,
                relay_address: None,
            },
            (Mode::FromSecondRelay, Some(Forward::Local { handler, .. })) => ConnectMessage {
                mode: Mode::FromServer,
                noise: handler.on_handshake(msg.noise, msg.peer_address?).await?,
                peer_address: self.dht.remote_address(),
                relay_address: None,
            },
            (Mode::FromSecondRelay, Some(Forward::Relayed { relay, .. })) => {
                let leg = ConnectMessage {
                    mode: Mode::FromRelay,
                    noise: msg.noise,
                    peer_address: msg.peer_address,
                    relay_address: None,
                };
                let res = self.relay(target, Command::PeerHandshake, leg.encode(), relay).await?;
                let back = decode_connect(&res, Mode::FromServer)?;
                ConnectMessage {
                    mode: Mode::FromServer,
                    noise: back.noise,
                    peer_address: Some(res.from.addr),
                    relay_address: None,
                }
            }
            _ => return None,
        };
        Some(reply.encode())
    }

    async fn on_holepunch(&self, req: IncomingRequest) -> Option<Vec<u8>> {
        let target = req.target?;
        let msg = HolepunchMessage::decode(req.value.as_deref()?).ok()?;
        let forward = self.forward(&target);

        let reply = match (msg.mode, forward) {
            (Mode::FromClient, Some(Forward::Local { handler, .. })) => HolepunchMessage {
                mode: Mode::Reply,
                id: msg.id,
                payload: handler.on_holepunch(msg.id, msg.payload, req.from).await?,
                peer_address: None,
            },
            (Mode::FromClient, Some(Forward::Relayed { relay, .. })) => {
                let leg = HolepunchMessage {
                    mode: Mode::FromRelay,
                    id: msg.id,
                    payload: msg.payload,
                    peer_address: Some(req.from),
                };
                let res = self.relay(target, Command::PeerHolepunch, leg.encode(), relay).await?;
                let back = res
                    .value
                    .as_deref()
                    .and_then(|v| HolepunchMessage::decode(v).ok())
                    .filter(|m| m.mode == Mode::FromServer)?;
                HolepunchMessage {
                    mode: Mode::Reply,
                    id: msg.id,
                    payload: back.payload,
                    peer_address: Some(res.from.addr),
                }
            }
            (Mode::FromRelay, Some(Forward::Local { handler, .. })) => HolepunchMessage {
                mode: Mode::FromServer,
                id: msg.id,
                payload: handler.on_holepunch(msg.id, msg.payload, msg.peer_address?).await?,
                peer_address: None,
            },
            _ => return None,
        };
        Some(reply.encode())
    }

    fn on_announce(&self, req: &IncomingRequest, unannounce: bool) -> Option<Vec<u8>> {
        let target = req.target?;
        let token = req.token?;
        let id = self.dht.node_id()?;
        let msg = AnnounceMessage::decode(req.value.as_deref()?).ok()?;
        if msg.peer.public_key.target() != target {
            tracing::debug!("announce from {} for a foreign target", req.from);
            return None;
        }

        let namespace = if unannounce { &self.ns.unannounce } else { &self.ns.announce };
        let digest = signable(namespace, &target, &token, &id, &msg.peer.encode(), msg.refresh.as_ref());
        if msg.peer.public_key.verify(&digest, &msg.signature).is_err() {
            tracing::debug!("dropping announce from {} with a bad signature", req.from);
            return None;
        }

        let mut table = self.table();
        if unannounce {
            table.unannounce(&target);
            tracing::debug!("unannounced {} from {}", hex::encode(&target[..8]), req.from);
        } else {
            table.announce(target, req.from, msg.peer);
            tracing::debug!("relaying {} for {}", hex::encode(&target[..8]), req.from);
        }
        Some(Vec::new())
    }
}

fn decode_connect(res: &Response, mode: Mode) -> Option<ConnectMessage> {
    res.value
        .as_deref()
        .and_then(|v| ConnectMessage::decode(v).ok())
        .filter(|m| m.mode == mode)
}

#[async_trait]
impl RequestHandler for Router {
    async fn on_request(&self, request: IncomingRequest) -> Option<Vec<u8>> {
        match request.command {
            Command::PeerHandshake => self.on_connect(request).await,
            Command::PeerHolepunch => self.on_holepunch(request).await,
            Command::FindPeer | Command::Lookup => {
                let target = request.target?;
                self.record(&target).map(|r| r.encode())
            }
            Command::Announce => self.on_announce(&request, false),
            Command::Unannounce => self.on_announce(&request, true),
            Command::Ping => None,
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("forwards", &self.table().len())
            .finish_non_exhaustive()
    }
}

/// Holepunch exchanges for one attempt, sent through a fixed node.
#[derive(Clone)]
pub struct HolepunchRoute {
    /// Client-side router
    pub router: Arc<Router>,
    /// Server target
    pub target: [u8; 32],
    /// Node to send through
    pub via: SocketAddrV4,
    /// Server slot
    pub id: u64,
}

#[async_trait]
impl HolepunchRelay for HolepunchRoute {
    async fn exchange(&self, sealed: Vec<u8>) -> Result<RelayedReply, HolepunchError> {
        Ok(self.router.holepunch(self.target, self.via, self.id, sealed).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::collect;
    use crate::dht::memory::{MemoryDht, MemoryNetwork, NatBehavior};
    use burrow_crypto::KeyPair;

    /// Server stand-in: echoes noise reversed and remembers who it saw.
    #[derive(Default)]
    struct Echo {
        peers: Mutex<Vec<SocketAddrV4>>,
    }

    #[async_trait]
    impl PeerHandler for Echo {
        async fn on_handshake(&self, mut noise: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>> {
            self.peers.lock().unwrap().push(peer);
            noise.reverse();
            Some(noise)
        }

        async fn on_holepunch(&self, id: u64, mut payload: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>> {
            self.peers.lock().unwrap().push(peer);
            payload.push(id as u8);
            Some(payload)
        }
    }

    struct Node {
        dht: Arc<MemoryDht>,
        router: Arc<Router>,
    }

    fn node(net: &MemoryNetwork) -> Node {
        let dht = net.add_node(false, NatBehavior::Open);
        let router = Router::new(dht.clone(), Arc::new(Namespaces::new()), ForwardConfig::default());
        dht.set_handler(router.clone());
        Node { dht, router }
    }

    async fn announce_to(server: &Node, keys: &KeyPair, relay: SocketAddrV4, unannounce: bool) -> bool {
        let ns = Namespaces::new();
        let target = keys.public_key().target();
        let replies = collect(server.dht.query(target, Command::Lookup, None)).await;
        let reply = replies.iter().find(|r| r.from.addr == relay).unwrap();
        let token = reply.token.unwrap();
        let peer = PeerRecord {
            public_key: keys.public_key(),
            relay_addresses: vec![relay],
            timestamp: 1,
        };
        let namespace = if unannounce { ns.unannounce } else { ns.announce };
        let digest = signable(&namespace, &target, &token, &reply.from.id.unwrap(), &peer.encode(), None);
        let msg = AnnounceMessage {
            peer,
            refresh: None,
            signature: keys.sign(&digest),
        };
        let command = if unannounce { Command::Unannounce } else { Command::Announce };
        server
            .dht
            .request(Some(target), command, Some(msg.encode()), relay, RequestOptions { socket: None, token: Some(token) })
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_direct_handshake() {
        let net = MemoryNetwork::new();
        let server = node(&net);
        let client = node(&net);
        let echo = Arc::new(Echo::default());
        server.router.set_local([7; 32], echo.clone());

        let reply = client
            .router
            .connect([7; 32], server.dht.addr(), vec![1, 2, 3], None)
            .await
            .unwrap();
        assert_eq!(reply.noise, vec![3, 2, 1]);
        assert_eq!(reply.server_address, server.dht.addr());
        assert_eq!(reply.client_address, client.dht.addr());
        assert_eq!(reply.holepunch_via, server.dht.addr());
        assert!(!reply.relayed);
        assert_eq!(echo.peers.lock().unwrap().as_slice(), &[client.dht.addr()]);
    }

    #[tokio::test]
    async fn test_one_hop_relay() {
        let net = MemoryNetwork::new();
        let relay = node(&net);
        let server = node(&net);
        let client = node(&net);
        let keys = KeyPair::from_seed(&[1; 32]);
        let target = keys.public_key().target();
        let echo = Arc::new(Echo::default());
        server.router.set_local(target, echo.clone());

        assert!(announce_to(&server, &keys, relay.dht.addr(), false).await);
        assert!(relay.router.is_relaying(&target));

        let reply = client
            .router
            .connect(target, relay.dht.addr(), vec![1, 2], None)
            .await
            .unwrap();
        assert_eq!(reply.noise, vec![2, 1]);
        assert!(reply.relayed);
        assert_eq!(reply.server_address, server.dht.addr());
        assert_eq!(reply.holepunch_via, relay.dht.addr());

        let punched = client
            .router
            .holepunch(target, reply.holepunch_via, 5, vec![0xaa])
            .await
            .unwrap();
        assert_eq!(punched.payload, vec![0xaa, 5]);
        assert_eq!(punched.peer_address, server.dht.addr());
        assert_eq!(
            echo.peers.lock().unwrap().as_slice(),
            &[client.dht.addr(), client.dht.addr()]
        );
    }

    #[tokio::test]
    async fn test_two_hop_relay() {
        let net = MemoryNetwork::new();
        let first = node(&net);
        let second = node(&net);
        let server = node(&net);
        let client = node(&net);
        let keys = KeyPair::from_seed(&[2; 32]);
        let target = keys.public_key().target();
        let echo = Arc::new(Echo::default());
        server.router.set_local(target, echo.clone());
        assert!(announce_to(&server, &keys, second.dht.addr(), false).await);

        let reply = client
            .router
            .connect(target, first.dht.addr(), vec![9], Some(second.dht.addr()))
            .await
            .unwrap();
        assert_eq!(reply.noise, vec![9]);
        assert_eq!(reply.server_address, server.dht.addr());
        assert_eq!(reply.holepunch_via, second.dht.addr());
        assert_eq!(echo.peers.lock().unwrap().as_slice(), &[client.dht.addr()]);

        let missing = client
            .router
            .connect(target, first.dht.addr(), vec![9], None)
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let net = MemoryNetwork::new();
        let relay = node(&net);
        let server = node(&net);
        let keys = KeyPair::from_seed(&[3; 32]);
        let target = keys.public_key().target();

        let replies = collect(server.dht.query(target, Command::Lookup, None)).await;
        let token = replies[0].token;
        let msg = AnnounceMessage {
            peer: PeerRecord {
                public_key: keys.public_key(),
                relay_addresses: Vec::new(),
                timestamp: 1,
            },
            refresh: None,
            signature: keys.sign(b"something else"),
        };
        let res = server
            .dht
            .request(Some(target), Command::Announce, Some(msg.encode()), relay.dht.addr(), RequestOptions { socket: None, token })
            .await;
        assert!(res.is_err());
        assert!(!relay.router.is_relaying(&target));
    }

    #[tokio::test]
    async fn test_find_peer_and_unannounce() {
        let net = MemoryNetwork::new();
        let relay = node(&net);
        let server = node(&net);
        let keys = KeyPair::from_seed(&[4; 32]);
        let target = keys.public_key().target();
        assert!(announce_to(&server, &keys, relay.dht.addr(), false).await);

        let found = relay.router.record(&target).unwrap();
        assert_eq!(found.public_key, keys.public_key());
        assert_eq!(found.relay_addresses, vec![relay.dht.addr()]);

        assert!(announce_to(&server, &keys, relay.dht.addr(), true).await);
        assert!(relay.router.record(&target).is_none());
    }

    /// Substrate whose replies claim to come from somewhere else.
    struct Spoofed(Arc<MemoryDht>);

    #[async_trait]
    impl Dht for Spoofed {
        fn query(&self, target: [u8; 32], command: Command, value: Option<Vec<u8>>) -> tokio::sync::mpsc::Receiver<crate::dht::QueryReply> {
            self.0.query(target, command, value)
        }

        async fn request(
            &self,
            target: Option<[u8; 32]>,
            command: Command,
            value: Option<Vec<u8>>,
            to: SocketAddrV4,
            options: RequestOptions,
        ) -> Result<Response, crate::error::DhtError> {
            let mut res = self.0.request(target, command, value, to, options).await?;
            res.from.addr = "6.6.6.6:6".parse().unwrap();
            Ok(res)
        }

        fn firewalled(&self) -> bool {
            false
        }

        fn remote_address(&self) -> Option<SocketAddrV4> {
            self.0.remote_address()
        }

        fn node_id(&self) -> Option<[u8; 32]> {
            self.0.node_id()
        }

        fn sample_nodes(&self, max: usize) -> Vec<SocketAddrV4> {
            self.0.sample_nodes(max)
        }

        fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
            self.0.set_handler(handler);
        }
    }

    #[tokio::test]
    async fn test_reply_from_wrong_address_rejected() {
        let net = MemoryNetwork::new();
        let server = node(&net);
        server.router.set_local([8; 32], Arc::new(Echo::default()));
        let client = Router::new(
            Arc::new(Spoofed(net.add_node(false, NatBehavior::Open))),
            Arc::new(Namespaces::new()),
            ForwardConfig::default(),
        );

        let err = client
            .connect([8; 32], server.dht.addr(), vec![1], None)
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::BadHandshakeReply);
        let err = client
            .holepunch([8; 32], server.dht.addr(), 0, vec![1])
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::BadHolepunchReply);
    }
}
