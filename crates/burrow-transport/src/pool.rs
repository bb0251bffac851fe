//! UDP socket pool.
//!
//! Sockets are handed out as [`SocketLease`]s. When the last lease on a
//! socket is dropped the socket lingers for a short while so a follow-up
//! pairing attempt can reuse its NAT mapping instead of binding a fresh
//! port. At most `linger_max` sockets linger at once; the rest close
//! immediately.
//!
//! Every socket runs a receive loop that routes datagrams by shape, see the
//! crate docs for the table. Routing never blocks: handlers are synchronous
//! and spawn work of their own when they need to.

use crate::wire::{self, HOLEPUNCH};
use crate::{PoolConfig, TransportError, TransportResult, udp};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

const MAX_DATAGRAM: usize = 65535;

/// Receiver for DHT traffic (datagrams that are not probes, preconnects or claimed frames).
pub trait DatagramSink: Send + Sync {
    /// Handle one datagram that arrived on `socket`.
    fn on_datagram(&self, socket: &Arc<PoolSocket>, data: &[u8], from: SocketAddrV4);
}

/// Per-socket receiver for holepunch traffic.
pub trait HolepunchHandler: Send + Sync {
    /// A one-byte probe arrived.
    fn on_probe(&self, socket: &Arc<PoolSocket>, from: SocketAddrV4);

    /// A stream frame arrived. Return `true` to consume it.
    fn on_stream_frame(&self, socket: &Arc<PoolSocket>, data: &[u8], from: SocketAddrV4) -> bool {
        let _ = (socket, data, from);
        false
    }
}

/// Gate between pool sockets and the network.
///
/// Lets a deployment or a test put a middlebox model in front of the pool.
/// `outbound` sees every datagram a pool socket sends and `inbound` decides
/// whether a received datagram is routed at all.
pub trait PacketFilter: Send + Sync {
    /// Whether a datagram from `from` arriving on `local` is delivered.
    fn inbound(&self, local: SocketAddrV4, data: &[u8], from: SocketAddrV4) -> bool;

    /// Whether a datagram from `local` to `to` goes on the wire. `ttl` is
    /// set for short-lived sends. A refused send still reports success to
    /// the caller.
    fn outbound(&self, local: SocketAddrV4, to: SocketAddrV4, ttl: Option<u32>) -> bool {
        let _ = (local, to, ttl);
        true
    }
}

type FilterSlot = RwLock<Option<Arc<dyn PacketFilter>>>;

type PreconnectFn = Box<dyn FnOnce(Arc<PoolSocket>, SocketAddrV4) + Send + Sync>;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sockets currently open (leased or lingering)
    pub open: usize,
    /// Sockets lingering without a lease
    pub lingering: usize,
    /// Registered preconnect handlers
    pub pairings: usize,
    /// Probes received across all sockets
    pub probes_received: u64,
    /// Datagrams received across all sockets
    pub datagrams_received: u64,
    /// Received datagrams dropped by the packet filter
    pub filtered: u64,
}

/// One pooled UDP socket.
pub struct PoolSocket {
    id: u64,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddrV4,
    holepunch_ttl: u32,
    default_ttl: u32,
    refs: AtomicUsize,
    generation: AtomicU64,
    closed: AtomicBool,
    handler: RwLock<Option<Arc<dyn HolepunchHandler>>>,
    filter: Arc<FilterSlot>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolSocket {
    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Whether the socket has been closed or detached.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Install or clear the holepunch handler.
    pub fn set_holepunch_handler(&self, handler: Option<Arc<dyn HolepunchHandler>>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = handler;
        }
    }

    fn holepunch_handler(&self) -> Option<Arc<dyn HolepunchHandler>> {
        self.handler.read().ok().and_then(|slot| slot.clone())
    }

    fn filter(&self) -> Option<Arc<dyn PacketFilter>> {
        self.filter.read().ok().and_then(|slot| slot.clone())
    }

    fn passes_outbound(&self, to: SocketAddrV4, ttl: Option<u32>) -> bool {
        self.filter()
            .is_none_or(|filter| filter.outbound(self.local_addr, to, ttl))
    }

    /// Send a datagram.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is closed or the send fails.
    pub async fn send(&self, data: &[u8], to: SocketAddrV4) -> TransportResult<usize> {
        self.send_with_ttl(data, to, None).await
    }

    async fn send_with_ttl(&self, data: &[u8], to: SocketAddrV4, ttl: Option<u32>) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.passes_outbound(to, ttl) {
            return Ok(data.len());
        }
        Ok(self.socket.send_to(data, SocketAddr::V4(to)).await?)
    }

    /// Send without waiting. Returns `false` if the datagram was not sent.
    pub fn try_send(&self, data: &[u8], to: SocketAddrV4) -> bool {
        if self.is_closed() {
            return false;
        }
        if !self.passes_outbound(to, None) {
            return true;
        }
        self.socket.try_send_to(data, SocketAddr::V4(to)).is_ok()
    }

    /// Send a probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn probe(&self, to: SocketAddrV4) -> TransportResult<()> {
        self.send(&HOLEPUNCH, to).await.map(|_| ())
    }

    /// Send a probe with a short TTL so it opens the local NAT mapping but
    /// dies before reaching a wrong destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the TTL cannot be set or the send fails.
    pub async fn probe_low_ttl(&self, to: SocketAddrV4) -> TransportResult<()> {
        self.socket.set_ttl(self.holepunch_ttl)?;
        let sent = self.send_with_ttl(&HOLEPUNCH, to, Some(self.holepunch_ttl)).await;
        self.socket.set_ttl(self.default_ttl)?;
        sent.map(|_| ())
    }

    fn stop_receiving(&self) {
        let task = self.recv_task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PoolSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSocket")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A counted reference to a pooled socket. Dropping it releases the reference.
pub struct SocketLease {
    socket: Arc<PoolSocket>,
    pool: Weak<PoolInner>,
    detached: bool,
}

impl SocketLease {
    /// The leased socket.
    #[must_use]
    pub fn socket(&self) -> &Arc<PoolSocket> {
        &self.socket
    }

    /// Take another reference on the same socket.
    #[must_use]
    pub fn share(&self) -> SocketLease {
        self.socket.refs.fetch_add(1, Ordering::AcqRel);
        SocketLease {
            socket: Arc::clone(&self.socket),
            pool: self.pool.clone(),
            detached: false,
        }
    }

    /// Remove the socket from the pool and hand over the raw socket.
    ///
    /// The receive loop stops, the holepunch handler is cleared and the
    /// socket will never linger or be reused.
    #[must_use]
    pub fn detach(mut self) -> Arc<UdpSocket> {
        self.detached = true;
        let socket = &self.socket;
        socket.set_holepunch_handler(None);
        socket.stop_receiving();
        socket.closed.store(true, Ordering::Release);
        if let Some(pool) = self.pool.upgrade() {
            pool.forget(socket);
        }
        Arc::clone(&socket.socket)
    }
}

impl std::ops::Deref for SocketLease {
    type Target = PoolSocket;

    fn deref(&self) -> &PoolSocket {
        &self.socket
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => pool.release(&self.socket),
            None => close_socket(&self.socket),
        }
    }
}

impl std::fmt::Debug for SocketLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SocketLease").field(&self.socket).finish()
    }
}

/// Registration returned by [`SocketPool::pair`]. Unregisters on drop.
#[derive(Debug)]
pub struct PairingGuard {
    id: u32,
    pool: Weak<PoolInner>,
}

impl PairingGuard {
    /// The pairing id to give to the remote side.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PairingGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.pairings.remove(&self.id);
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    sink: RwLock<Option<Arc<dyn DatagramSink>>>,
    filter: Arc<FilterSlot>,
    sockets: Mutex<HashMap<u64, Arc<PoolSocket>>>,
    lingering: Mutex<VecDeque<Arc<PoolSocket>>>,
    pairings: DashMap<u32, PreconnectFn>,
    next_id: AtomicU64,
    closed: AtomicBool,
    probes_received: AtomicU64,
    datagrams_received: AtomicU64,
    filtered: AtomicU64,
}

impl PoolInner {
    fn dispatch(&self, socket: &Arc<PoolSocket>, data: &[u8], from: SocketAddrV4) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let admitted = socket
            .filter()
            .is_none_or(|filter| filter.inbound(socket.local_addr, data, from));
        if !admitted {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("filtered {} bytes from {} on {}", data.len(), from, socket.local_addr);
            return;
        }

        if data.is_empty() {
            return;
        }

        if data.len() == 1 {
            self.probes_received.fetch_add(1, Ordering::Relaxed);
            match socket.holepunch_handler() {
                Some(handler) => handler.on_probe(socket, from),
                None => tracing::trace!("probe from {} on idle socket {}", from, socket.local_addr),
            }
            return;
        }

        let pairing = wire::parse_preconnect(data).and_then(|id| self.pairings.remove(&id));
        if let Some((id, handler)) = pairing {
            tracing::debug!("preconnect {:08x} from {} on {}", id, from, socket.local_addr);
            handler(Arc::clone(socket), from);
            return;
        }

        if wire::is_stream_frame(data) {
            let claimed = socket
                .holepunch_handler()
                .is_some_and(|handler| handler.on_stream_frame(socket, data, from));
            if claimed {
                return;
            }
        }

        let sink = self.sink.read().ok().and_then(|slot| slot.clone());
        if let Some(sink) = sink {
            sink.on_datagram(socket, data, from);
        }
    }

    fn release(self: &Arc<Self>, socket: &Arc<PoolSocket>) {
        if socket.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        socket.set_holepunch_handler(None);

        if socket.is_closed() || self.closed.load(Ordering::Acquire) {
            self.close(socket);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.close(socket);
            return;
        };

        let generation = {
            let Ok(mut lingering) = self.lingering.lock() else {
                return;
            };
            if lingering.len() >= self.config.linger_max {
                drop(lingering);
                self.close(socket);
                return;
            }
            lingering.push_back(Arc::clone(socket));
            socket.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        tracing::trace!("socket {} lingering", socket.local_addr);
        let pool = Arc::downgrade(self);
        let socket = Arc::clone(socket);
        let linger_time = self.config.linger_time;
        runtime.spawn(async move {
            tokio::time::sleep(linger_time).await;
            if let Some(pool) = pool.upgrade() {
                pool.expire(&socket, generation);
            }
        });
    }

    fn expire(&self, socket: &Arc<PoolSocket>, generation: u64) {
        if socket.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let removed = match self.lingering.lock() {
            Ok(mut lingering) => {
                let before = lingering.len();
                lingering.retain(|s| s.id != socket.id);
                before != lingering.len()
            }
            Err(_) => false,
        };
        if removed {
            tracing::trace!("lingering socket {} expired", socket.local_addr);
            self.close(socket);
        }
    }

    fn take_lingering(&self) -> Option<Arc<PoolSocket>> {
        let socket = self.lingering.lock().ok()?.pop_back()?;
        socket.generation.fetch_add(1, Ordering::AcqRel);
        socket.refs.store(1, Ordering::Release);
        Some(socket)
    }

    fn forget(&self, socket: &Arc<PoolSocket>) {
        if let Ok(mut sockets) = self.sockets.lock() {
            sockets.remove(&socket.id);
        }
        if let Ok(mut lingering) = self.lingering.lock() {
            lingering.retain(|s| s.id != socket.id);
        }
    }

    fn close(&self, socket: &Arc<PoolSocket>) {
        self.forget(socket);
        close_socket(socket);
    }
}

fn close_socket(socket: &PoolSocket) {
    socket.closed.store(true, Ordering::Release);
    socket.set_holepunch_handler(None);
    socket.stop_receiving();
}

async fn recv_loop(socket: Arc<PoolSocket>, pool: Weak<PoolInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    // A handler may detach the socket mid-dispatch; stop before reading again.
    while !socket.is_closed() {
        let (len, from) = match socket.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                if socket.is_closed() {
                    break;
                }
                // ICMP errors surface here on some platforms; keep reading.
                tracing::trace!("recv error on {}: {}", socket.local_addr, e);
                continue;
            }
        };
        let SocketAddr::V4(from) = from else {
            continue;
        };
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.dispatch(&socket, &buf[..len], from);
    }
}

/// Shared UDP socket pool. Cheap to clone.
#[derive(Clone)]
pub struct SocketPool {
    inner: Arc<PoolInner>,
}

impl SocketPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                sink: RwLock::new(None),
                filter: Arc::new(RwLock::new(None)),
                sockets: Mutex::new(HashMap::new()),
                lingering: Mutex::new(VecDeque::new()),
                pairings: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                probes_received: AtomicU64::new(0),
                datagrams_received: AtomicU64::new(0),
                filtered: AtomicU64::new(0),
            }),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Route DHT traffic arriving on pool sockets to `sink`.
    pub fn set_sink(&self, sink: Arc<dyn DatagramSink>) {
        if let Ok(mut slot) = self.inner.sink.write() {
            *slot = Some(sink);
        }
    }

    /// Install or clear the packet filter for every socket of the pool,
    /// including ones already bound.
    pub fn set_filter(&self, filter: Option<Arc<dyn PacketFilter>>) {
        if let Ok(mut slot) = self.inner.filter.write() {
            *slot = filter;
        }
    }

    /// Lease a socket, reusing a lingering one when available.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is closed or binding fails.
    pub fn acquire(&self) -> TransportResult<SocketLease> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if let Some(socket) = self.inner.take_lingering() {
            tracing::trace!("reusing lingering socket {}", socket.local_addr);
            return Ok(self.lease(socket));
        }
        self.bind()
    }

    /// Lease `count` freshly bound sockets for birthday punching.
    ///
    /// # Errors
    ///
    /// Returns the first bind error; sockets bound so far are released.
    pub fn acquire_many(&self, count: usize) -> TransportResult<Vec<SocketLease>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        (0..count).map(|_| self.bind()).collect()
    }

    fn bind(&self) -> TransportResult<SocketLease> {
        let config = &self.inner.config;
        let socket = udp::bind(SocketAddrV4::new(config.bind_host, 0), config)?;
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            other => return Err(TransportError::UnsupportedAddress(other)),
        };

        let socket = Arc::new(PoolSocket {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            socket: Arc::new(socket),
            local_addr,
            holepunch_ttl: config.holepunch_ttl,
            default_ttl: config.default_ttl,
            refs: AtomicUsize::new(1),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            handler: RwLock::new(None),
            filter: Arc::clone(&self.inner.filter),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(recv_loop(Arc::clone(&socket), Arc::downgrade(&self.inner)));
        if let Ok(mut slot) = socket.recv_task.lock() {
            *slot = Some(task);
        }
        if let Ok(mut sockets) = self.inner.sockets.lock() {
            sockets.insert(socket.id, Arc::clone(&socket));
        }

        tracing::trace!("bound pool socket {}", local_addr);
        Ok(self.lease(socket))
    }

    fn lease(&self, socket: Arc<PoolSocket>) -> SocketLease {
        SocketLease {
            socket,
            pool: Arc::downgrade(&self.inner),
            detached: false,
        }
    }

    /// Register a one-shot handler for a preconnect notification carrying `id`.
    ///
    /// The handler runs on whichever pool socket the notification lands on.
    pub fn pair<F>(&self, id: u32, handler: F) -> PairingGuard
    where
        F: FnOnce(Arc<PoolSocket>, SocketAddrV4) + Send + Sync + 'static,
    {
        self.inner.pairings.insert(id, Box::new(handler));
        PairingGuard {
            id,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// A random pairing id not currently registered.
    #[must_use]
    pub fn random_pairing_id(&self) -> u32 {
        loop {
            let id = rand::random::<u32>();
            if !self.inner.pairings.contains_key(&id) {
                return id;
            }
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            open: self.inner.sockets.lock().map(|s| s.len()).unwrap_or(0),
            lingering: self.inner.lingering.lock().map(|l| l.len()).unwrap_or(0),
            pairings: self.inner.pairings.len(),
            probes_received: self.inner.probes_received.load(Ordering::Relaxed),
            datagrams_received: self.inner.datagrams_received.load(Ordering::Relaxed),
            filtered: self.inner.filtered.load(Ordering::Relaxed),
        }
    }

    /// Close every socket. Outstanding leases become inert.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sockets: Vec<_> = match self.inner.sockets.lock() {
            Ok(mut sockets) => sockets.drain().map(|(_, s)| s).collect(),
            Err(_) => Vec::new(),
        };
        for socket in &sockets {
            close_socket(socket);
        }
        if let Ok(mut lingering) = self.inner.lingering.lock() {
            lingering.clear();
        }
        self.inner.pairings.clear();
        tracing::debug!("socket pool closed ({} sockets)", sockets.len());
    }
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPool")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn loopback_pool(linger_max: usize, linger_time: Duration) -> SocketPool {
        SocketPool::new(PoolConfig {
            bind_host: Ipv4Addr::LOCALHOST,
            linger_max,
            linger_time,
            ..PoolConfig::default()
        })
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Probe(SocketAddrV4),
        Frame(Vec<u8>),
        Dht(Vec<u8>),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl HolepunchHandler for Recorder {
        fn on_probe(&self, _socket: &Arc<PoolSocket>, from: SocketAddrV4) {
            let _ = self.0.send(Event::Probe(from));
        }

        fn on_stream_frame(&self, _: &Arc<PoolSocket>, data: &[u8], _: SocketAddrV4) -> bool {
            let _ = self.0.send(Event::Frame(data.to_vec()));
            true
        }
    }

    impl DatagramSink for Recorder {
        fn on_datagram(&self, _socket: &Arc<PoolSocket>, data: &[u8], _from: SocketAddrV4) {
            let _ = self.0.send(Event::Dht(data.to_vec()));
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_binds_distinct_sockets() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
        assert_eq!(pool.stats().open, 2);
    }

    #[tokio::test]
    async fn test_released_socket_is_reused() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let lease = pool.acquire().unwrap();
        let addr = lease.local_addr();
        drop(lease);
        assert_eq!(pool.stats().lingering, 1);

        let again = pool.acquire().unwrap();
        assert_eq!(again.local_addr(), addr);
        assert_eq!(pool.stats().lingering, 0);
    }

    #[tokio::test]
    async fn test_shared_lease_keeps_socket() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let lease = pool.acquire().unwrap();
        let shared = lease.share();
        drop(lease);
        assert_eq!(pool.stats().lingering, 0);
        drop(shared);
        assert_eq!(pool.stats().lingering, 1);
    }

    #[tokio::test]
    async fn test_lingering_socket_expires() {
        let pool = loopback_pool(10, Duration::from_millis(50));
        let lease = pool.acquire().unwrap();
        let socket = Arc::clone(lease.socket());
        drop(lease);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(socket.is_closed());
        assert_eq!(pool.stats().open, 0);
        assert_eq!(pool.stats().lingering, 0);
    }

    #[tokio::test]
    async fn test_linger_limit() {
        let pool = loopback_pool(1, Duration::from_secs(3));
        let leases = pool.acquire_many(3).unwrap();
        let sockets: Vec<_> = leases.iter().map(|l| Arc::clone(l.socket())).collect();
        drop(leases);
        assert_eq!(pool.stats().lingering, 1);
        assert_eq!(sockets.iter().filter(|s| s.is_closed()).count(), 2);
    }

    #[tokio::test]
    async fn test_demux_probe_frame_and_dht() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.set_sink(Arc::new(Recorder(tx.clone())));

        let lease = pool.acquire().unwrap();
        lease.set_holepunch_handler(Some(Arc::new(Recorder(tx))));

        let sender = pool.acquire().unwrap();
        sender.probe(lease.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Probe(sender.local_addr()));

        sender.send(&[wire::STREAM_TAG, 1, 2], lease.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Frame(vec![wire::STREAM_TAG, 1, 2]));

        sender.send(b"dht message", lease.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Dht(b"dht message".to_vec()));
    }

    #[tokio::test]
    async fn test_preconnect_is_one_shot() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.set_sink(Arc::new(Recorder(tx)));

        let (hit_tx, mut hit_rx) = mpsc::unbounded_channel();
        let id = pool.random_pairing_id();
        let guard = pool.pair(id, move |socket, from| {
            let _ = hit_tx.send((socket.local_addr(), from));
        });
        assert_eq!(guard.id(), id);

        let listener = pool.acquire().unwrap();
        let sender = pool.acquire().unwrap();
        sender.send(&wire::preconnect(id), listener.local_addr()).await.unwrap();

        let (on, from) = tokio::time::timeout(Duration::from_secs(2), hit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(on, listener.local_addr());
        assert_eq!(from, sender.local_addr());

        // Second notification falls through to the DHT sink.
        sender.send(&wire::preconnect(id), listener.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Dht(wire::preconnect(id).to_vec()));
    }

    #[tokio::test]
    async fn test_pairing_guard_unregisters() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let guard = pool.pair(7, |_, _| {});
        assert_eq!(pool.stats().pairings, 1);
        drop(guard);
        assert_eq!(pool.stats().pairings, 0);
    }

    #[tokio::test]
    async fn test_detach_hands_over_socket() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lease = pool.acquire().unwrap();
        lease.set_holepunch_handler(Some(Arc::new(Recorder(tx))));
        let addr = lease.local_addr();

        let raw = lease.detach();
        assert_eq!(pool.stats().open, 0);
        assert_eq!(pool.stats().lingering, 0);

        let sender = pool.acquire().unwrap();
        sender.probe(addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), raw.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &HOLEPUNCH);
        assert_eq!(from, SocketAddr::V4(sender.local_addr()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_low_ttl_probe_on_loopback() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = pool.acquire().unwrap();
        target.set_holepunch_handler(Some(Arc::new(Recorder(tx))));

        let sender = pool.acquire().unwrap();
        sender.probe_low_ttl(target.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Probe(sender.local_addr()));
    }

    /// Admits single-byte datagrams only from listed senders and keeps
    /// short-lived sends off the wire.
    #[derive(Default)]
    struct AllowList {
        senders: Mutex<Vec<SocketAddrV4>>,
        sent: Mutex<Vec<(SocketAddrV4, SocketAddrV4, Option<u32>)>>,
    }

    impl PacketFilter for AllowList {
        fn inbound(&self, _local: SocketAddrV4, data: &[u8], from: SocketAddrV4) -> bool {
            data.len() != 1 || self.senders.lock().unwrap().contains(&from)
        }

        fn outbound(&self, local: SocketAddrV4, to: SocketAddrV4, ttl: Option<u32>) -> bool {
            self.sent.lock().unwrap().push((local, to, ttl));
            ttl.is_none()
        }
    }

    #[tokio::test]
    async fn test_filter_drops_before_routing() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.set_sink(Arc::new(Recorder(tx.clone())));
        let target = pool.acquire().unwrap();
        target.set_holepunch_handler(Some(Arc::new(Recorder(tx))));

        let blocked = pool.acquire().unwrap();
        let allowed = pool.acquire().unwrap();
        let filter = Arc::new(AllowList::default());
        filter.senders.lock().unwrap().push(allowed.local_addr());
        pool.set_filter(Some(filter.clone()));

        blocked.probe(target.local_addr()).await.unwrap();
        blocked.send(b"dht message", target.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Dht(b"dht message".to_vec()));

        allowed.probe(target.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Probe(allowed.local_addr()));
        assert_eq!(pool.stats().filtered, 1);

        let sent = filter.sent.lock().unwrap().clone();
        assert!(sent.contains(&(blocked.local_addr(), target.local_addr(), None)));
        assert!(sent.contains(&(allowed.local_addr(), target.local_addr(), None)));

        // Refused on the way out, so the next thing to arrive is the DHT message.
        allowed.probe_low_ttl(target.local_addr()).await.unwrap();
        allowed.send(b"after", target.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Dht(b"after".to_vec()));
        let ttl = pool.config().holepunch_ttl;
        assert!(filter.sent.lock().unwrap().contains(&(allowed.local_addr(), target.local_addr(), Some(ttl))));

        pool.set_filter(None);
        blocked.probe(target.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Probe(blocked.local_addr()));
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let pool = loopback_pool(10, Duration::from_secs(3));
        let lease = pool.acquire().unwrap();
        pool.close();
        assert!(lease.is_closed());
        assert!(matches!(pool.acquire(), Err(TransportError::Closed)));
    }
}
