//! Per-attempt holepunch state machine.
//!
//! ```text
//! Created -> Opened -> Probing -> Punching -> Connected
//!     \________\__________\__________\______-> Destroyed
//! ```
//!
//! A pair owns its socket leases. Whichever socket first hears from the
//! remote wins; the others go back to the pool, and the winner is detached
//! and handed to the caller by [`Pair::wait_connected`].

use super::{HolepunchCodec, HolepunchPayload, HolepunchRelay, HolepunchStatus, PairConfig, RawConnection};
use crate::dht::Dht;
use crate::error::HolepunchError;
use crate::nat::{Firewall, NatClassifier, NatConfig};
use burrow_crypto::Namespaces;
use burrow_transport::wire::{self, HOLEPUNCH};
use burrow_transport::{HolepunchHandler, PairingGuard, PoolSocket, SocketLease, SocketPool};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared collaborators of every pair on a node.
#[derive(Clone)]
pub struct PairContext {
    /// DHT used for NAT sampling
    pub dht: Arc<dyn Dht>,
    /// Socket source
    pub pool: SocketPool,
    /// Domain separation keys
    pub ns: Arc<Namespaces>,
    /// Classifier thresholds
    pub nat: NatConfig,
    /// Pair timing
    pub config: PairConfig,
}

impl std::fmt::Debug for PairContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairContext")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PairState {
    /// Constructed, no socket yet
    Created,
    /// Socket bound, NAT sampling running
    Opened,
    /// Round one in progress
    Probing,
    /// Probes flowing
    Punching,
    /// A socket heard from the remote
    Connected,
    /// Torn down
    Destroyed,
}

impl PairState {
    /// Whether no further transition except teardown can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Connected | Self::Destroyed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RemoteAddress {
    addr: SocketAddrV4,
    verified: bool,
}

struct Winner {
    socket: Arc<PoolSocket>,
    remote: SocketAddrV4,
}

#[derive(Default)]
struct Session {
    sockets: Vec<SocketLease>,
    nat: Option<Arc<NatClassifier>>,
    codec: Option<Arc<HolepunchCodec>>,
    remote_firewall: Firewall,
    remote_addresses: Vec<RemoteAddress>,
    remote_hosts: Vec<Ipv4Addr>,
    remote_token: Option<[u8; 32]>,
    winner: Option<Winner>,
    pending: Vec<Vec<u8>>,
    taken: bool,
    pairing: Option<PairingGuard>,
    timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    failure: Option<HolepunchError>,
}

pub(super) struct PairInner {
    pub(super) ctx: PairContext,
    pub(super) initiator: bool,
    firewalled: bool,
    state: watch::Sender<PairState>,
    session: Mutex<Session>,
}

struct ProbeHandler(Weak<PairInner>);

impl HolepunchHandler for ProbeHandler {
    fn on_probe(&self, socket: &Arc<PoolSocket>, from: SocketAddrV4) {
        if let Some(pair) = self.0.upgrade() {
            pair.on_probe(socket, from);
        }
    }

    fn on_stream_frame(&self, socket: &Arc<PoolSocket>, data: &[u8], from: SocketAddrV4) -> bool {
        self.0
            .upgrade()
            .is_some_and(|pair| pair.on_stream_frame(socket, data, from))
    }
}

impl PairInner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn state(&self) -> PairState {
        *self.state.borrow()
    }

    pub(super) fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Move forward to `next`. Backward moves are ignored.
    pub(super) fn advance(&self, next: PairState) -> bool {
        self.state.send_if_modified(|current| {
            if next <= *current {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Sleep unless the pair reaches a terminal state first.
    pub(super) async fn pause(&self, duration: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            () = tokio::time::sleep(duration) => !self.is_done(),
            _ = rx.wait_for(|s| s.is_terminal()) => false,
        }
    }

    pub(super) fn failure(&self) -> HolepunchError {
        self.session()
            .failure
            .clone()
            .unwrap_or(HolepunchError::Destroyed)
    }

    fn ensure_live(&self) -> Result<(), HolepunchError> {
        match self.state() {
            PairState::Destroyed => Err(self.failure()),
            _ => Ok(()),
        }
    }

    fn codec(&self) -> Result<Arc<HolepunchCodec>, HolepunchError> {
        self.session().codec.clone().ok_or(HolepunchError::NotOpen)
    }

    pub(super) fn main(&self) -> Option<(Arc<PoolSocket>, Arc<NatClassifier>)> {
        let s = self.session();
        let socket = s.sockets.first().map(|l| Arc::clone(l.socket()))?;
        Some((socket, s.nat.clone()?))
    }

    pub(super) fn remote_firewall(&self) -> Firewall {
        self.session().remote_firewall
    }

    /// Best known remote address: verified with a port, then any with a port, then host only.
    pub(super) fn remote_address(&self) -> Option<SocketAddrV4> {
        let s = self.session();
        let with_port = |r: &&RemoteAddress| r.addr.port() != 0;
        s.remote_addresses
            .iter()
            .filter(with_port)
            .find(|r| r.verified)
            .or_else(|| s.remote_addresses.iter().find(with_port))
            .or_else(|| s.remote_addresses.first())
            .map(|r| r.addr)
    }

    fn remote_token(&self) -> Option<[u8; 32]> {
        self.session().remote_token
    }

    fn add_remote_host(&self, host: Ipv4Addr) {
        let mut s = self.session();
        if !s.remote_hosts.contains(&host) {
            s.remote_hosts.push(host);
        }
    }

    fn accepts(&self, host: &Ipv4Addr) -> bool {
        self.session().remote_hosts.contains(host)
    }

    /// Keep a background task so teardown can abort it.
    pub(super) fn track(&self, task: JoinHandle<()>) {
        let mut s = self.session();
        if self.is_done() {
            task.abort();
        } else {
            s.tasks.retain(|t| !t.is_finished());
            s.tasks.push(task);
        }
    }

    /// Take extra sockets into the pair. Returns their handles, or `None`
    /// if the pair finished meanwhile.
    pub(super) fn adopt(self: &Arc<Self>, leases: Vec<SocketLease>) -> Option<Vec<Arc<PoolSocket>>> {
        let mut handles = Vec::with_capacity(leases.len());
        for lease in &leases {
            let handler: Arc<dyn HolepunchHandler> = Arc::new(ProbeHandler(Arc::downgrade(self)));
            lease.set_holepunch_handler(Some(handler));
            handles.push(Arc::clone(lease.socket()));
        }
        let mut s = self.session();
        if self.is_done() {
            drop(s);
            drop(leases);
            return None;
        }
        s.sockets.extend(leases);
        Some(handles)
    }

    /// Install our probe handler on `lease` and start classifying it.
    pub(super) fn bind_socket(self: &Arc<Self>, lease: &SocketLease) -> Arc<NatClassifier> {
        let handler: Arc<dyn HolepunchHandler> = Arc::new(ProbeHandler(Arc::downgrade(self)));
        lease.set_holepunch_handler(Some(handler));

        let nat = NatClassifier::new(self.ctx.nat.clone(), self.firewalled);
        if self.firewalled {
            let sampler = tokio::spawn(
                Arc::clone(&nat).auto_sample(Arc::clone(&self.ctx.dht), Arc::clone(lease.socket())),
            );
            self.track(sampler);
        } else {
            let local = lease.local_addr();
            let host = self
                .ctx
                .dht
                .remote_address()
                .map_or(*local.ip(), |addr| *addr.ip());
            nat.set_open(SocketAddrV4::new(host, local.port()));
        }
        nat
    }

    /// Swap the main socket for a fresh one with a fresh classifier.
    fn reopen(self: &Arc<Self>) -> Result<(), HolepunchError> {
        let lease = self.ctx.pool.acquire()?;
        let nat = self.bind_socket(&lease);
        let local = lease.local_addr();

        let swapped = {
            let mut s = self.session();
            if self.is_done() || s.sockets.is_empty() {
                None
            } else {
                let old = std::mem::replace(&mut s.sockets[0], lease);
                Some((old, s.nat.replace(Arc::clone(&nat))))
            }
        };

        let Some((old, old_nat)) = swapped else {
            nat.destroy();
            return match self.state() {
                PairState::Destroyed => Err(self.failure()),
                _ => Ok(()),
            };
        };
        if let Some(old_nat) = old_nat {
            old_nat.destroy();
        }
        tracing::debug!("pair reopened {} -> {}", old.local_addr(), local);
        drop(old);
        Ok(())
    }

    fn absorb(&self, payload: &HolepunchPayload, peer: SocketAddrV4, our_token: &[u8; 32]) {
        let verified = payload.remote_token.as_ref() == Some(our_token);
        let addr = payload
            .address
            .unwrap_or_else(|| SocketAddrV4::new(*peer.ip(), 0));

        let mut s = self.session();
        s.remote_firewall = payload.firewall;
        if payload.token.is_some() {
            s.remote_token = payload.token;
        }
        match s.remote_addresses.iter_mut().find(|r| r.addr == addr) {
            Some(known) => known.verified |= verified,
            None => s.remote_addresses.push(RemoteAddress { addr, verified }),
        }
        if !s.remote_hosts.contains(addr.ip()) {
            s.remote_hosts.push(*addr.ip());
        }
    }

    fn on_probe(&self, socket: &Arc<PoolSocket>, from: SocketAddrV4) {
        if self.is_done() {
            return;
        }
        if !self.accepts(from.ip()) {
            tracing::trace!("dropping probe from unexpected host {}", from);
            return;
        }
        socket.try_send(&HOLEPUNCH, from);
        self.connected(socket, from, None);
    }

    fn on_stream_frame(&self, socket: &Arc<PoolSocket>, data: &[u8], from: SocketAddrV4) -> bool {
        if !self.accepts(from.ip()) {
            return false;
        }
        match self.state() {
            PairState::Destroyed => false,
            PairState::Connected => {
                let mut s = self.session();
                let ours = !s.taken
                    && s
                        .winner
                        .as_ref()
                        .is_some_and(|w| Arc::ptr_eq(&w.socket, socket));
                if ours {
                    s.pending.push(data.to_vec());
                }
                ours
            }
            _ => {
                self.connected(socket, from, Some(data.to_vec()));
                true
            }
        }
    }

    fn connected(&self, socket: &Arc<PoolSocket>, from: SocketAddrV4, frame: Option<Vec<u8>>) {
        let (released, nat, pairing) = {
            let mut s = self.session();
            if s.winner.is_some() || self.is_done() {
                return;
            }
            s.winner = Some(Winner {
                socket: Arc::clone(socket),
                remote: from,
            });
            s.pending.extend(frame);
            let (keep, released): (Vec<_>, Vec<_>) = std::mem::take(&mut s.sockets)
                .into_iter()
                .partition(|lease| Arc::ptr_eq(lease.socket(), socket));
            s.sockets = keep;
            (released, s.nat.clone(), s.pairing.take())
        };
        drop(released);
        drop(pairing);
        if let Some(nat) = nat {
            nat.destroy();
        }
        self.advance(PairState::Connected);
        tracing::debug!("pair connected {} <-> {}", socket.local_addr(), from);
    }

    pub(super) fn destroy(&self, reason: Option<HolepunchError>) -> bool {
        {
            let mut s = self.session();
            if self.state() == PairState::Destroyed {
                return false;
            }
            if s.failure.is_none() {
                s.failure = reason;
            }
        }
        if !self.advance(PairState::Destroyed) {
            return false;
        }

        let (sockets, pairing, timer, tasks, nat) = {
            let mut s = self.session();
            (
                std::mem::take(&mut s.sockets),
                s.pairing.take(),
                s.timer.take(),
                std::mem::take(&mut s.tasks),
                s.nat.clone(),
            )
        };
        for task in tasks {
            task.abort();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        drop(pairing);
        drop(sockets);
        if let Some(nat) = nat {
            nat.destroy();
        }
        tracing::debug!("pair destroyed");
        true
    }
}

/// Reject a peer whose own address claim names a different host than the
/// relay observed. Ports differ legitimately since the relay sees the DHT
/// socket, not the pair socket.
///
/// # Errors
///
/// Returns [`HolepunchError::AddressMismatch`] on disagreement.
pub fn check_agreement(claimed: Option<SocketAddrV4>, observed: SocketAddrV4) -> Result<(), HolepunchError> {
    match claimed {
        Some(claimed) if claimed.ip() != observed.ip() => {
            Err(HolepunchError::AddressMismatch { claimed, observed })
        }
        _ => Ok(()),
    }
}

fn advertised(nat: &NatClassifier) -> Option<SocketAddrV4> {
    nat.address().or_else(|| nat.host())
}

/// One connection attempt's holepunch session.
#[derive(Clone)]
pub struct Pair {
    inner: Arc<PairInner>,
}

impl Pair {
    /// New pair. The firewall flag is read from the DHT.
    #[must_use]
    pub fn new(ctx: PairContext, initiator: bool) -> Self {
        let firewalled = ctx.dht.firewalled();
        let (state, _rx) = watch::channel(PairState::Created);
        Self {
            inner: Arc::new(PairInner {
                ctx,
                initiator,
                firewalled,
                state,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Acquire the main socket and start NAT sampling on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair is destroyed or no socket can be bound.
    pub fn open(&self) -> Result<(), HolepunchError> {
        match self.inner.state() {
            PairState::Created => {}
            PairState::Destroyed => return Err(self.inner.failure()),
            _ => return Ok(()),
        }
        let lease = self.inner.ctx.pool.acquire()?;
        let nat = self.inner.bind_socket(&lease);
        tracing::trace!("pair opened on {}", lease.local_addr());
        {
            let mut s = self.inner.session();
            s.sockets.push(lease);
            s.nat = Some(nat);
        }
        self.inner.advance(PairState::Opened);
        Ok(())
    }

    /// Install the payload key derived from the Noise transcript.
    pub fn set_handshake_hash(&self, handshake_hash: &[u8]) {
        let codec = HolepunchCodec::new(&self.inner.ctx.ns, handshake_hash);
        self.inner.session().codec = Some(Arc::new(codec));
    }

    /// Payload codec, once the handshake hash is known.
    #[must_use]
    pub fn codec(&self) -> Option<Arc<HolepunchCodec>> {
        self.inner.codec().ok()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PairState {
        self.inner.state()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PairState> {
        self.inner.state.subscribe()
    }

    /// Whether this side initiated the connection.
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.inner.initiator
    }

    /// Local address of the main socket.
    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddrV4> {
        self.inner.main().map(|(socket, _)| socket.local_addr())
    }

    /// Local classification.
    #[must_use]
    pub fn firewall(&self) -> Firewall {
        self.inner
            .main()
            .map_or(Firewall::Unknown, |(_, nat)| nat.firewall())
    }

    /// External address of the main socket, when predictable.
    #[must_use]
    pub fn public_address(&self) -> Option<SocketAddrV4> {
        self.inner.main().and_then(|(_, nat)| nat.address())
    }

    /// Classifier of the main socket.
    #[must_use]
    pub fn nat(&self) -> Option<Arc<NatClassifier>> {
        self.inner.main().map(|(_, nat)| nat)
    }

    /// Remote classification as last reported.
    #[must_use]
    pub fn remote_firewall(&self) -> Firewall {
        self.inner.remote_firewall()
    }

    /// Best known remote address.
    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddrV4> {
        self.inner.remote_address()
    }

    /// Accept probes from `host`.
    pub fn add_remote_host(&self, host: Ipv4Addr) {
        self.inner.add_remote_host(host);
    }

    /// Sockets currently leased.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.inner.session().sockets.len()
    }

    /// Dial addresses the remote published as directly reachable.
    ///
    /// With a `pairing` id a preconnect notification goes out instead of a
    /// probe, so the remote answers from its own pair socket. Returns
    /// `false` when there is nothing to dial.
    pub fn connect(&self, addrs: &[SocketAddrV4], pairing: Option<u32>) -> bool {
        let Some((socket, _)) = self.inner.main() else {
            return false;
        };
        if addrs.is_empty() || self.inner.is_done() {
            return false;
        }
        for addr in addrs {
            self.inner.add_remote_host(*addr.ip());
        }

        let inner = Arc::clone(&self.inner);
        let addrs = addrs.to_vec();
        let task = tokio::spawn(async move {
            let config = &inner.ctx.config;
            for _ in 0..config.consistent_tries {
                for addr in &addrs {
                    let sent = match pairing {
                        Some(id) => socket.send(&wire::preconnect(id), *addr).await.map(|_| ()),
                        None => socket.probe(*addr).await,
                    };
                    if let Err(e) = sent {
                        tracing::trace!("direct dial to {} failed: {}", addr, e);
                    }
                }
                if !inner.pause(config.consistent_interval).await {
                    return;
                }
            }
        });
        self.inner.track(task);
        true
    }

    /// Register a preconnect id. When a notification carrying it arrives on
    /// any pool socket, the pair probes its sender from the main socket.
    pub fn listen_preconnect(&self) -> u32 {
        let pool = &self.inner.ctx.pool;
        let id = pool.random_pairing_id();
        let weak = Arc::downgrade(&self.inner);
        let guard = pool.pair(id, move |_socket, from| {
            if let Some(inner) = weak.upgrade() {
                inner.add_remote_host(*from.ip());
                inner.clone().consistent_probe(from, false);
            }
        });
        self.inner.session().pairing = Some(guard);
        id
    }

    /// Initiator round one: trade classifications until both are settled.
    ///
    /// `believed` is the server address reported by the relay.
    ///
    /// # Errors
    ///
    /// Fails with [`HolepunchError::DoubleRandomized`] when both sides are
    /// random, [`HolepunchError::ProbeTimeout`] when the classifications do
    /// not settle within the reopen budget, or any relay or verification
    /// error. The pair is destroyed on failure.
    pub async fn round_one(&self, relay: &dyn HolepunchRelay, believed: SocketAddrV4) -> Result<(), HolepunchError> {
        let result = self.run_round_one(relay, believed).await;
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    async fn run_round_one(&self, relay: &dyn HolepunchRelay, believed: SocketAddrV4) -> Result<(), HolepunchError> {
        let inner = &self.inner;
        let config = &inner.ctx.config;
        let codec = inner.codec()?;
        inner.advance(PairState::Probing);
        inner.add_remote_host(*believed.ip());

        let mut target = believed;
        let mut reopens = 0;
        loop {
            inner.ensure_live()?;
            if inner.state() == PairState::Connected {
                return Ok(());
            }
            let (socket, nat) = inner.main().ok_or(HolepunchError::NotOpen)?;

            if let Err(e) = socket.probe_low_ttl(target).await {
                tracing::trace!("session probe to {} failed: {}", target, e);
            }
            let token = codec.token(target.ip());
            let request = HolepunchPayload {
                status: HolepunchStatus::Probe,
                firewall: nat.firewall(),
                address: advertised(&nat),
                remote_address: Some(target),
                token: Some(token),
                remote_token: None,
            };
            let (reply, peer) = self.exchange(relay, &codec, &request).await?;
            inner.absorb(&reply, peer, &token);

            if let Some(corrected) = reply.address.filter(|a| a.port() != 0 && *a != target) {
                target = corrected;
                if let Err(e) = socket.probe_low_ttl(corrected).await {
                    tracing::trace!("session probe to {} failed: {}", corrected, e);
                }
            }

            if reply.firewall == Firewall::Unknown && !inner.pause(config.remote_unknown_wait).await {
                inner.ensure_live()?;
                return Ok(());
            }

            let _ = tokio::time::timeout(config.analyze_timeout, nat.analyzing()).await;
            inner.ensure_live()?;
            if inner.state() == PairState::Connected {
                return Ok(());
            }

            let local = nat.firewall();
            let remote = inner.remote_firewall();
            if local == Firewall::Random && remote == Firewall::Random {
                return Err(HolepunchError::DoubleRandomized);
            }
            if local != Firewall::Unknown && remote != Firewall::Unknown {
                tracing::debug!("round one settled: local {} remote {}", local, remote);
                return Ok(());
            }
            if reopens >= config.max_reopens {
                return Err(HolepunchError::ProbeTimeout);
            }
            reopens += 1;
            if local == Firewall::Unknown {
                inner.reopen()?;
            }
        }
    }

    /// Initiator round two: prove both addresses and start punching.
    ///
    /// # Errors
    ///
    /// Fails with [`HolepunchError::RemoteNotHolepunching`] or
    /// [`HolepunchError::RemoteUnverified`] when the remote declines or does
    /// not echo our token. The pair is destroyed on failure.
    pub async fn round_two(&self, relay: &dyn HolepunchRelay) -> Result<(), HolepunchError> {
        let result = self.run_round_two(relay).await;
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    async fn run_round_two(&self, relay: &dyn HolepunchRelay) -> Result<(), HolepunchError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        if inner.state() == PairState::Connected {
            return Ok(());
        }
        let codec = inner.codec()?;
        let (_, nat) = inner.main().ok_or(HolepunchError::NotOpen)?;
        let target = inner.remote_address().ok_or(HolepunchError::RemoteUnverified)?;

        let token = codec.token(target.ip());
        let request = HolepunchPayload {
            status: HolepunchStatus::Punch,
            firewall: nat.firewall(),
            address: advertised(&nat),
            remote_address: Some(target),
            token: Some(token),
            remote_token: inner.remote_token(),
        };
        let (reply, peer) = self.exchange(relay, &codec, &request).await?;
        match reply.status {
            HolepunchStatus::Punch => {}
            HolepunchStatus::Connected => return Ok(()),
            _ => return Err(HolepunchError::RemoteNotHolepunching),
        }
        if reply.remote_token != Some(token) {
            return Err(HolepunchError::RemoteUnverified);
        }
        inner.absorb(&reply, peer, &token);
        inner.punch()
    }

    async fn exchange(
        &self,
        relay: &dyn HolepunchRelay,
        codec: &HolepunchCodec,
        request: &HolepunchPayload,
    ) -> Result<(HolepunchPayload, SocketAddrV4), HolepunchError> {
        let sealed = codec.encrypt(request).map_err(|_| HolepunchError::BadReply)?;
        let reply = relay.exchange(sealed).await?;
        let payload = codec
            .decrypt(&reply.payload)
            .ok_or(HolepunchError::BadReply)?;
        if payload.status == HolepunchStatus::Abort {
            return Err(HolepunchError::RemoteAborted);
        }
        check_agreement(payload.address, reply.peer_address)?;
        Ok((payload, reply.peer_address))
    }

    /// Responder side of both rounds. Returns the reply payload, or `None`
    /// to stay silent.
    pub async fn on_remote_payload(&self, payload: HolepunchPayload, peer: SocketAddrV4) -> Option<HolepunchPayload> {
        let inner = &self.inner;
        match inner.state() {
            PairState::Destroyed => return None,
            PairState::Connected => {
                return Some(HolepunchPayload::status(HolepunchStatus::Connected, self.firewall()));
            }
            _ => {}
        }
        let codec = inner.codec().ok()?;
        let (socket, nat) = inner.main()?;

        if let Err(e) = check_agreement(payload.address, peer) {
            tracing::warn!("holepunch from {}: {}", peer, e);
            return Some(HolepunchPayload::status(HolepunchStatus::Abort, nat.firewall()));
        }

        inner.add_remote_host(*peer.ip());
        let token = codec.token(peer.ip());
        inner.absorb(&payload, peer, &token);

        match payload.status {
            HolepunchStatus::Abort => {
                self.fail(HolepunchError::RemoteAborted);
                None
            }
            HolepunchStatus::Connected => None,
            HolepunchStatus::Probe => {
                inner.advance(PairState::Probing);
                if let Some(addr) = inner.remote_address().filter(|a| a.port() != 0) {
                    if let Err(e) = socket.probe_low_ttl(addr).await {
                        tracing::trace!("session probe to {} failed: {}", addr, e);
                    }
                }
                let config = &inner.ctx.config;
                let _ = tokio::time::timeout(config.analyze_timeout, nat.analyzing()).await;
                Some(HolepunchPayload {
                    status: HolepunchStatus::Probe,
                    firewall: nat.firewall(),
                    address: advertised(&nat),
                    remote_address: Some(peer),
                    token: Some(token),
                    remote_token: payload.token,
                })
            }
            HolepunchStatus::Punch => {
                let local = nat.firewall();
                let reply = |status| HolepunchPayload {
                    status,
                    firewall: local,
                    address: advertised(&nat),
                    remote_address: Some(peer),
                    token: Some(token),
                    remote_token: payload.token,
                };

                if payload.remote_token != Some(token) {
                    tracing::debug!("unverified punch request from {}", peer);
                    return Some(reply(HolepunchStatus::Probe));
                }
                if let Err(e) = inner.punch() {
                    tracing::debug!("declining punch from {}: {}", peer, e);
                    return Some(reply(HolepunchStatus::Abort));
                }
                if local.is_stable() && payload.firewall.is_stable() {
                    if let Some(addr) = inner.remote_address() {
                        socket.try_send(&HOLEPUNCH, addr);
                    }
                }
                Some(reply(HolepunchStatus::Punch))
            }
        }
    }

    /// Start the punch strategy for the current pair of classifications.
    ///
    /// # Errors
    ///
    /// Fails when no strategy applies.
    pub fn punch(&self) -> Result<(), HolepunchError> {
        self.inner.punch()
    }

    /// Destroy the pair with [`HolepunchError::Timeout`] after `duration`
    /// unless it connects first. Re-arming replaces the previous timer.
    pub fn arm_timeout(&self, duration: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = weak.upgrade() {
                if inner.state() != PairState::Connected {
                    inner.destroy(Some(HolepunchError::Timeout));
                }
            }
        });
        let previous = {
            let mut s = self.inner.session();
            if self.inner.is_done() {
                timer.abort();
                None
            } else {
                s.timer.replace(timer)
            }
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Wait for a connected socket and take it.
    ///
    /// # Errors
    ///
    /// Returns the reason the pair was destroyed, or
    /// [`HolepunchError::Destroyed`] if the socket was already taken.
    pub async fn wait_connected(&self) -> Result<RawConnection, HolepunchError> {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => PairState::Destroyed,
        };
        if state != PairState::Connected {
            return Err(self.inner.failure());
        }

        let (lease, remote, timer, tasks) = {
            let mut s = self.inner.session();
            if s.taken {
                return Err(HolepunchError::Destroyed);
            }
            let Some((socket, remote)) = s.winner.as_ref().map(|w| (Arc::clone(&w.socket), w.remote)) else {
                return Err(HolepunchError::Destroyed);
            };
            let Some(index) = s.sockets.iter().position(|l| Arc::ptr_eq(l.socket(), &socket)) else {
                return Err(HolepunchError::Destroyed);
            };
            s.taken = true;
            (
                s.sockets.remove(index),
                remote,
                s.timer.take(),
                std::mem::take(&mut s.tasks),
            )
        };
        for task in tasks {
            task.abort();
        }
        if let Some(timer) = timer {
            timer.abort();
        }

        let socket = lease.detach();
        let pending = std::mem::take(&mut self.inner.session().pending);
        Ok(RawConnection {
            socket,
            remote,
            pending,
        })
    }

    /// Tear down. Returns `false` if already destroyed.
    pub fn destroy(&self) -> bool {
        self.inner.destroy(None)
    }

    /// Tear down with `reason`, reported to waiters.
    pub fn fail(&self, reason: HolepunchError) -> bool {
        self.inner.destroy(Some(reason))
    }

    /// Whether the pair was torn down.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state() == PairState::Destroyed
    }
}

impl std::fmt::Debug for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair")
            .field("state", &self.state())
            .field("initiator", &self.inner.initiator)
            .field("firewall", &self.firewall())
            .field("remote_firewall", &self.remote_firewall())
            .finish()
    }
}
