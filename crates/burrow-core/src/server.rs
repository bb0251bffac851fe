//! Responder side of the connection pipeline.
//!
//! A listening server owns:
//!
//! | Piece | Purpose |
//! |-------|---------|
//! | Announcer | keeps the record at up to three relays |
//! | Router local entry | delivers handshakes and holepunches to this server |
//! | Handshake cache | answers retransmitted Noise requests with the same reply |
//! | Attempt arena | one holepunch [`Pair`] per handshake, addressed by small id |
//! | Listen socket | direct dial target when the node is not firewalled |
//!
//! Every attempt ends in one of two ways: its pair connects and the
//! stream is handed to [`Server::accept`], or it is destroyed by its timer,
//! the GC sweep or [`Server::close`].

use crate::arena::Arena;
use crate::error::{NodeError, Result};
use crate::node::NodeContext;
use crate::policy::ConnectionPolicy;
use crate::stream::SecretStream;
use async_trait::async_trait;
use burrow_crypto::{HandshakeResult, KeyPair, NoiseHandshake, PublicKey};
use burrow_discovery::messages::{HandshakePayload, HandshakeStatus, PROTOCOL_UTP, PROTOCOL_VERSION};
use burrow_discovery::{
    AnnounceError, Announcer, Cancel, CancelToken, Firewall, HolepunchPayload, HolepunchStatus, Pair, PeerHandler,
};
use burrow_transport::SocketLease;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connected streams waiting for [`Server::accept`].
const ACCEPT_BACKLOG: usize = 64;

/// Cached reply to one Noise request. `None` while the first copy is
/// still being processed.
struct Handshake {
    reply: Option<Vec<u8>>,
    created: Instant,
}

/// One in-flight holepunch attempt.
struct Attempt {
    pair: Pair,
    serial: u64,
    /// The GC sweep reaps the attempt once this passes.
    expires: Instant,
}

#[derive(Default)]
struct Listening {
    keys: Option<KeyPair>,
    target: Option<[u8; 32]>,
    announcer: Option<Announcer>,
    listen: Option<SocketLease>,
    address: Option<SocketAddrV4>,
    gc: Option<JoinHandle<()>>,
}

struct ServerInner {
    ctx: Arc<NodeContext>,
    policy: Arc<dyn ConnectionPolicy>,
    listening: Mutex<Listening>,
    connects: DashMap<String, Handshake>,
    attempts: Mutex<Arena<Attempt>>,
    serial: AtomicU64,
    incoming: mpsc::Sender<SecretStream>,
    accepted: tokio::sync::Mutex<mpsc::Receiver<SecretStream>>,
    closed: Cancel,
}

/// A server accepting encrypted connections for one key pair.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub(crate) fn new(ctx: Arc<NodeContext>, policy: Arc<dyn ConnectionPolicy>) -> Self {
        let (incoming, accepted) = mpsc::channel(ACCEPT_BACKLOG);
        Self {
            inner: Arc::new(ServerInner {
                ctx,
                policy,
                listening: Mutex::new(Listening::default()),
                connects: DashMap::new(),
                attempts: Mutex::new(Arena::new()),
                serial: AtomicU64::new(0),
                incoming,
                accepted: tokio::sync::Mutex::new(accepted),
                closed: Cancel::new(),
            }),
        }
    }

    /// Start accepting connections for `keys`: register with the router,
    /// announce to the closest nodes and start the GC sweep.
    ///
    /// Finding no relay is not fatal; the announcer keeps retrying.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::AlreadyListening`] on a second call,
    /// [`NodeError::NodeDestroyed`] after the node is destroyed, or a
    /// transport error if the listen socket cannot be bound.
    pub async fn listen(&self, keys: KeyPair) -> Result<()> {
        let inner = &self.inner;
        inner.ctx.ensure_live()?;
        if inner.closed.is_cancelled() {
            return Err(NodeError::invalid_state("server is closed"));
        }
        if inner.listening().keys.is_some() {
            return Err(NodeError::AlreadyListening);
        }

        let ctx = &inner.ctx;
        let (listen, address) = if ctx.dht.firewalled() {
            (None, None)
        } else {
            let lease = ctx.pool.acquire()?;
            let local = lease.local_addr();
            let host = ctx.dht.remote_address().map_or(*local.ip(), |addr| *addr.ip());
            (Some(lease), Some(SocketAddrV4::new(host, local.port())))
        };

        let target = keys.public_key().target();
        let announcer = Announcer::new(
            Arc::clone(&ctx.dht),
            Some(Arc::clone(&ctx.router)),
            Arc::clone(&ctx.ns),
            keys.clone(),
            ctx.config.announcer.clone(),
        );
        {
            let mut state = inner.listening();
            if state.keys.is_some() {
                return Err(NodeError::AlreadyListening);
            }
            state.keys = Some(keys.clone());
            state.target = Some(target);
            state.listen = listen;
            state.address = address;
            state.announcer = Some(announcer.clone());
        }

        ctx.router
            .set_local(target, Arc::new(ServerHandler(Arc::downgrade(inner))));
        match announcer.start().await {
            Ok(()) => tracing::info!(
                "listening as {} via {:?}, direct: {:?}",
                keys.public_key(),
                announcer.relay_addresses(),
                address
            ),
            Err(AnnounceError::NoRelays) => tracing::warn!("listening as {} without relays", keys.public_key()),
            Err(e) => tracing::warn!("announce for {} failed: {}", keys.public_key(), e),
        }

        let gc = tokio::spawn(gc_loop(
            Arc::downgrade(inner),
            inner.closed.token(),
            ctx.config.server.gc_interval,
        ));
        if let Some(previous) = inner.listening().gc.replace(gc) {
            previous.abort();
        }
        Ok(())
    }

    /// Next connected stream, or `None` once the server is closed.
    pub async fn accept(&self) -> Option<SecretStream> {
        let closed = self.inner.closed.token();
        if closed.is_cancelled() {
            return None;
        }
        let mut accepted = self.inner.accepted.lock().await;
        tokio::select! {
            stream = accepted.recv() => stream,
            () = closed.cancelled() => None,
        }
    }

    /// Stop listening: unannounce, leave the router and destroy every
    /// pending attempt. Streams already accepted stay open.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.closed.cancel() {
            return;
        }
        let (target, announcer, listen, gc) = {
            let mut state = inner.listening();
            (state.target, state.announcer.take(), state.listen.take(), state.gc.take())
        };
        if let Some(gc) = gc {
            gc.abort();
        }
        if let Some(target) = target {
            inner.ctx.router.remove_local(&target);
        }
        if let Some(announcer) = announcer {
            announcer.stop().await;
        }
        drop(listen);

        let attempts = inner.attempts().drain();
        for attempt in &attempts {
            attempt.pair.destroy();
        }
        inner.connects.clear();
        tracing::info!("server closed, {} pending attempts dropped", attempts.len());
    }

    /// Whether [`Server::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Whether [`Server::listen`] succeeded and the server is not closed.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.is_closed() && self.inner.listening().keys.is_some()
    }

    /// Key the server listens as.
    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.inner.listening().keys.as_ref().map(KeyPair::public_key)
    }

    /// Direct dial address, when the node is not firewalled.
    #[must_use]
    pub fn address(&self) -> Option<SocketAddrV4> {
        self.inner.listening().address
    }

    /// Relays currently holding the record.
    #[must_use]
    pub fn relay_addresses(&self) -> Vec<SocketAddrV4> {
        self.inner
            .listening()
            .announcer
            .as_ref()
            .map(Announcer::relay_addresses)
            .unwrap_or_default()
    }

    /// Announce again now, e.g. after a network change.
    pub fn refresh(&self) {
        if let Some(announcer) = self.inner.listening().announcer.as_ref() {
            announcer.refresh();
        }
    }

    /// Holepunch attempts still in flight.
    #[must_use]
    pub fn pending_attempts(&self) -> usize {
        self.inner.attempts().len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("public_key", &self.public_key())
            .field("address", &self.address())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ServerInner {
    fn listening(&self) -> MutexGuard<'_, Listening> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attempts(&self) -> MutexGuard<'_, Arena<Attempt>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer a Noise request once; retransmissions get the cached reply.
    async fn on_handshake(self: &Arc<Self>, noise: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>> {
        if self.closed.is_cancelled() {
            return None;
        }
        let key = hex::encode(&noise);
        match self.connects.entry(key.clone()) {
            Entry::Occupied(entry) => {
                tracing::trace!("repeated handshake from {}", peer);
                return entry.get().reply.clone();
            }
            Entry::Vacant(entry) => {
                entry.insert(Handshake {
                    reply: None,
                    created: Instant::now(),
                });
            }
        }

        let reply = self.handshake(&noise, peer).await;
        match &reply {
            Some(reply) => {
                if let Some(mut entry) = self.connects.get_mut(&key) {
                    entry.reply = Some(reply.clone());
                }
            }
            None => {
                self.connects.remove(&key);
            }
        }
        reply
    }

    async fn handshake(self: &Arc<Self>, noise: &[u8], peer: SocketAddrV4) -> Option<Vec<u8>> {
        let keys = self.listening().keys.clone()?;
        let mut responder = NoiseHandshake::responder(&keys).ok()?;
        let Some(request) = responder.recv(noise) else {
            tracing::trace!("dropping unauthenticated handshake from {}", peer);
            return None;
        };
        let Ok(remote_payload) = HandshakePayload::decode(&request) else {
            tracing::trace!("dropping malformed handshake payload from {}", peer);
            return None;
        };
        let remote = responder.remote_public_key()?;
        if !self.policy.firewall(&remote, &remote_payload, peer).await {
            tracing::debug!("policy rejected {} at {}", remote, peer);
            return None;
        }

        let firewalled = self.ctx.dht.firewalled();
        let local_firewall = if firewalled { Firewall::Unknown } else { Firewall::Open };
        let mut reply = HandshakePayload::new(local_firewall, PROTOCOL_UTP);
        if remote_payload.version != PROTOCOL_VERSION {
            tracing::debug!("{} speaks version {}", remote, remote_payload.version);
            reply.status = HandshakeStatus::VersionMismatch;
            return responder.send(&reply.encode()).ok();
        }
        if remote_payload.protocols & PROTOCOL_UTP == 0 {
            tracing::debug!("no shared protocol with {}", remote);
            reply.status = HandshakeStatus::Aborted;
            return responder.send(&reply.encode()).ok();
        }

        let pair = Pair::new(self.ctx.pair_context(), false);
        if let Err(e) = pair.open() {
            tracing::warn!("cannot open pair for {}: {}", remote, e);
            reply.status = HandshakeStatus::TryLater;
            return responder.send(&reply.encode()).ok();
        }
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let id = self.attempts().insert(Attempt {
            pair: pair.clone(),
            serial,
            expires: Instant::now() + self.ctx.config.server.handshake_timeout,
        });
        reply.holepunch = Some(id);
        if let Some(address) = self.listening().address {
            reply.addresses = vec![address];
            reply.pairing = Some(pair.listen_preconnect());
        }

        let sent = responder
            .send(&reply.encode())
            .and_then(|message| responder.finish().map(|result| (message, result)));
        let (message, result) = match sent {
            Ok(sent) => sent,
            Err(e) => {
                tracing::warn!("handshake with {} failed: {}", remote, e);
                self.release(id, serial);
                pair.destroy();
                return None;
            }
        };

        pair.set_handshake_hash(&result.handshake_hash);
        pair.add_remote_host(*peer.ip());
        if remote_payload.firewall == Firewall::Open && !remote_payload.addresses.is_empty() {
            pair.connect(&remote_payload.addresses, None);
        }
        pair.arm_timeout(self.ctx.config.server.pair_timeout);
        self.spawn_accept(id, serial, pair, result);
        tracing::debug!("handshake from {} at {}, attempt {}", remote, peer, id);
        Some(message)
    }

    async fn on_holepunch(&self, id: u64, sealed: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>> {
        let (pair, serial) = self
            .attempts()
            .get(id)
            .map(|attempt| (attempt.pair.clone(), attempt.serial))?;
        let codec = pair.codec()?;
        let Some(request) = codec.decrypt(&sealed) else {
            tracing::trace!("undecryptable holepunch for attempt {} from {}", id, peer);
            return None;
        };

        let vetoed = request.status == HolepunchStatus::Punch
            && !self.policy.holepunch(
                request.firewall,
                pair.firewall(),
                request.address.or(Some(peer)),
                pair.public_address(),
            );
        let reply = if vetoed {
            tracing::debug!("policy declined punching with {}", peer);
            let abort = HolepunchPayload::status(HolepunchStatus::Abort, pair.firewall());
            pair.destroy();
            abort
        } else {
            pair.on_remote_payload(request, peer).await?
        };
        if reply.status == HolepunchStatus::Punch {
            self.extend(id, serial, &pair, self.ctx.config.server.punch_timeout);
        }
        codec.encrypt(&reply).ok()
    }

    /// Wait for the attempt's pair and hand the stream to `accept`.
    fn spawn_accept(self: &Arc<Self>, id: u64, serial: u64, pair: Pair, handshake: HandshakeResult) {
        let server = Arc::downgrade(self);
        let incoming = self.incoming.clone();
        tokio::spawn(async move {
            let result = pair.wait_connected().await;
            if let Some(server) = server.upgrade() {
                server.release(id, serial);
            }
            match result {
                Ok(raw) => {
                    let stream = SecretStream::new(raw, &handshake);
                    tracing::info!(
                        "accepted {} at {}",
                        stream.remote_public_key(),
                        stream.remote_address()
                    );
                    if incoming.send(stream).await.is_err() {
                        tracing::debug!("server gone before accept");
                    }
                }
                Err(e) => tracing::debug!("attempt {} failed: {}", id, e),
            }
        });
    }

    /// Give attempt `serial` at `id` another `timeout`, both on the pair's
    /// timer and in the GC sweep.
    fn extend(&self, id: u64, serial: u64, pair: &Pair, timeout: Duration) {
        pair.arm_timeout(timeout);
        let mut attempts = self.attempts();
        if let Some(attempt) = attempts.get_mut(id).filter(|attempt| attempt.serial == serial) {
            attempt.expires = attempt.expires.max(Instant::now() + timeout);
        }
    }

    /// Free slot `id` if it still holds attempt `serial`.
    fn release(&self, id: u64, serial: u64) {
        let mut attempts = self.attempts();
        if attempts.get(id).is_some_and(|attempt| attempt.serial == serial) {
            attempts.remove(id);
        }
    }

    fn gc(&self) {
        let timeout = self.ctx.config.server.handshake_timeout;
        self.connects.retain(|_, handshake| handshake.created.elapsed() < timeout);
        let now = Instant::now();
        let expired = self
            .attempts()
            .remove_where(|attempt| attempt.pair.is_destroyed() || attempt.expires <= now);
        for attempt in &expired {
            attempt.pair.destroy();
        }
        if !expired.is_empty() {
            tracing::debug!("gc dropped {} attempts", expired.len());
        }
    }
}

async fn gc_loop(server: Weak<ServerInner>, closed: CancelToken, every: Duration) {
    while closed.pause(every).await {
        let Some(server) = server.upgrade() else {
            return;
        };
        server.gc();
    }
}

/// Router entry pointing back at a server.
struct ServerHandler(Weak<ServerInner>);

#[async_trait]
impl PeerHandler for ServerHandler {
    async fn on_handshake(&self, noise: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>> {
        let server = self.0.upgrade()?;
        server.on_handshake(noise, peer).await
    }

    async fn on_holepunch(&self, id: u64, payload: Vec<u8>, peer: SocketAddrV4) -> Option<Vec<u8>> {
        let server = self.0.upgrade()?;
        server.on_holepunch(id, payload, peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::Node;
    use burrow_discovery::{MemoryNetwork, NatBehavior};

    fn relays(net: &MemoryNetwork, config: &NodeConfig) -> Vec<Node> {
        (0..3)
            .map(|_| Node::new(net.add_node(false, NatBehavior::Open), config.clone()))
            .collect()
    }

    fn request(client: &KeyPair, server: &PublicKey) -> Vec<u8> {
        let mut noise = NoiseHandshake::initiator(client, server).unwrap();
        noise
            .send(&HandshakePayload::new(Firewall::Consistent, PROTOCOL_UTP).encode())
            .unwrap()
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let net = MemoryNetwork::new();
        let config = NodeConfig::loopback();
        let _relays = relays(&net, &config);
        let node = Node::new(net.add_node(false, NatBehavior::Open), config);
        let server = node.create_server(None).unwrap();
        let keys = KeyPair::from_seed(&[1; 32]);

        server.listen(keys.clone()).await.unwrap();
        assert!(server.is_listening());
        assert!(server.address().is_some());
        assert_eq!(server.public_key(), Some(keys.public_key()));
        assert_eq!(server.listen(keys).await.unwrap_err(), NodeError::AlreadyListening);

        server.close().await;
        assert!(!server.is_listening());
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_firewalled_server_has_no_listen_address() {
        let net = MemoryNetwork::new();
        let config = NodeConfig::loopback();
        let _relays = relays(&net, &config);
        let node = Node::new(net.add_node(true, NatBehavior::Consistent), config);
        let server = node.create_server(None).unwrap();
        server.listen(KeyPair::from_seed(&[2; 32])).await.unwrap();
        assert!(server.address().is_none());
        assert!(!server.relay_addresses().is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn test_repeated_handshake_gets_same_reply() {
        let net = MemoryNetwork::new();
        let config = NodeConfig::loopback();
        let node = Node::new(net.add_node(true, NatBehavior::Consistent), config);
        let server = node.create_server(None).unwrap();
        let keys = KeyPair::from_seed(&[3; 32]);
        server.listen(keys.clone()).await.unwrap();

        let message = request(&KeyPair::from_seed(&[4; 32]), &keys.public_key());
        let peer: SocketAddrV4 = "127.0.0.1:4000".parse().unwrap();
        let first = server.inner.on_handshake(message.clone(), peer).await.unwrap();
        let second = server.inner.on_handshake(message, peer).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.pending_attempts(), 1);
        server.close().await;
        assert_eq!(server.pending_attempts(), 0);
    }

    #[tokio::test]
    async fn test_garbage_handshake_is_dropped() {
        let net = MemoryNetwork::new();
        let node = Node::new(net.add_node(true, NatBehavior::Consistent), NodeConfig::loopback());
        let server = node.create_server(None).unwrap();
        server.listen(KeyPair::from_seed(&[5; 32])).await.unwrap();

        let peer: SocketAddrV4 = "127.0.0.1:4000".parse().unwrap();
        assert!(server.inner.on_handshake(vec![0; 96], peer).await.is_none());
        assert_eq!(server.pending_attempts(), 0);
        assert!(server.inner.connects.is_empty());

        // Addressed to another key
        let other = request(&KeyPair::from_seed(&[6; 32]), &KeyPair::from_seed(&[7; 32]).public_key());
        assert!(server.inner.on_handshake(other, peer).await.is_none());
        server.close().await;
    }

    #[tokio::test]
    async fn test_version_mismatch_reply() {
        let net = MemoryNetwork::new();
        let node = Node::new(net.add_node(true, NatBehavior::Consistent), NodeConfig::loopback());
        let server = node.create_server(None).unwrap();
        let keys = KeyPair::from_seed(&[8; 32]);
        server.listen(keys.clone()).await.unwrap();

        let client = KeyPair::from_seed(&[9; 32]);
        let mut noise = NoiseHandshake::initiator(&client, &keys.public_key()).unwrap();
        let mut payload = HandshakePayload::new(Firewall::Consistent, PROTOCOL_UTP);
        payload.version = PROTOCOL_VERSION + 1;
        let message = noise.send(&payload.encode()).unwrap();

        let reply = server
            .inner
            .on_handshake(message, "127.0.0.1:4000".parse().unwrap())
            .await
            .unwrap();
        let reply = HandshakePayload::decode(&noise.recv(&reply).unwrap()).unwrap();
        assert_eq!(reply.status, HandshakeStatus::VersionMismatch);
        assert!(reply.holepunch.is_none());
        assert_eq!(server.pending_attempts(), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn test_gc_expires_attempts() {
        let net = MemoryNetwork::new();
        let mut config = NodeConfig::loopback();
        config.server.handshake_timeout = Duration::from_millis(200);
        config.server.gc_interval = Duration::from_millis(50);
        let node = Node::new(net.add_node(true, NatBehavior::Consistent), config);
        let server = node.create_server(None).unwrap();
        let keys = KeyPair::from_seed(&[10; 32]);
        server.listen(keys.clone()).await.unwrap();

        let message = request(&KeyPair::from_seed(&[11; 32]), &keys.public_key());
        server
            .inner
            .on_handshake(message, "127.0.0.1:4000".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(server.pending_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.pending_attempts(), 0);
        assert!(server.inner.connects.is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn test_gc_spares_attempts_in_round_two() {
        let net = MemoryNetwork::new();
        let mut config = NodeConfig::loopback();
        config.server.handshake_timeout = Duration::from_millis(200);
        config.server.gc_interval = Duration::from_millis(50);
        let node = Node::new(net.add_node(true, NatBehavior::Consistent), config);
        let server = node.create_server(None).unwrap();
        let keys = KeyPair::from_seed(&[12; 32]);
        server.listen(keys.clone()).await.unwrap();

        let peer: SocketAddrV4 = "127.0.0.1:4000".parse().unwrap();
        for seed in [13, 14] {
            let message = request(&KeyPair::from_seed(&[seed; 32]), &keys.public_key());
            server.inner.on_handshake(message, peer).await.unwrap();
        }
        assert_eq!(server.pending_attempts(), 2);

        let (id, serial, punching) = {
            let attempts = server.inner.attempts();
            let (id, attempt) = attempts.iter().next().unwrap();
            (id, attempt.serial, attempt.pair.clone())
        };
        server.inner.extend(id, serial, &punching, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.pending_attempts(), 1);
        assert!(server.inner.attempts().get(id).is_some());
        assert!(!punching.is_destroyed());

        server.close().await;
        assert!(punching.is_destroyed());
    }
}
