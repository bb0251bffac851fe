//! Keeps a server's record announced at the nodes closest to its target.
//!
//! Each cycle looks up the target, commits a signed record to the closest
//! nodes and keeps the first few acceptances as relays. Between cycles the
//! relays are pinged so the NAT mapping they reach us through stays open.
//! Every node that accepted the record is tracked, relay or not, and is
//! unannounced once it drops out of a cycle or the announcer stops.

use crate::dht::{Command, Dht, QueryReply, RequestOptions, collect};
use crate::error::AnnounceError;
use crate::messages::{AnnounceMessage, MAX_RELAY_ADDRESSES, PeerRecord, signable};
use crate::relay::Router;
use crate::signal::{Cancel, CancelToken};
use burrow_crypto::{KeyPair, Namespaces};
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};

/// Announce cadence.
#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    /// Relays kept per cycle
    pub max_relays: usize,
    /// Closest nodes a record is committed to
    pub commit_fanout: usize,
    /// Gap between relay pings
    pub ping_interval: Duration,
    /// Pings before the next cycle
    pub pings_per_cycle: usize,
    /// Wait after a failed cycle
    pub retry_backoff: Duration,
    /// Cycles remembered for unannouncing
    pub history: usize,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            max_relays: MAX_RELAY_ADDRESSES,
            commit_fanout: 5,
            ping_interval: Duration::from_secs(3),
            pings_per_cycle: 100,
            retry_backoff: Duration::from_secs(5),
            history: 3,
        }
    }
}

/// A node holding our record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relay {
    /// Where the node answered from
    pub addr: SocketAddrV4,
    /// Its routing id
    pub id: [u8; 32],
    /// Write token it issued us
    pub token: [u8; 32],
}

#[derive(Default)]
struct State {
    relays: Vec<Relay>,
    /// Every node that accepted the last cycle's record
    committed: Vec<Relay>,
    history: VecDeque<Vec<Relay>>,
    cycles: u64,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    dht: Arc<dyn Dht>,
    router: Option<Arc<Router>>,
    ns: Arc<Namespaces>,
    keys: KeyPair,
    target: [u8; 32],
    config: AnnouncerConfig,
    state: Mutex<State>,
    refresh: Notify,
    cycles: watch::Sender<u64>,
    stop: Cancel,
}

/// Background announce loop for one key pair.
#[derive(Clone)]
pub struct Announcer {
    inner: Arc<Inner>,
}

impl Announcer {
    /// New announcer. With a `router` the local record is published on it too.
    #[must_use]
    pub fn new(
        dht: Arc<dyn Dht>,
        router: Option<Arc<Router>>,
        ns: Arc<Namespaces>,
        keys: KeyPair,
        config: AnnouncerConfig,
    ) -> Self {
        let target = keys.public_key().target();
        let (cycles, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                dht,
                router,
                ns,
                keys,
                target,
                config,
                state: Mutex::new(State::default()),
                refresh: Notify::new(),
                cycles,
                stop: Cancel::new(),
            }),
        }
    }

    /// Target the record is announced under.
    #[must_use]
    pub fn target(&self) -> [u8; 32] {
        self.inner.target
    }

    /// Run one cycle now, then keep cycling in the background.
    ///
    /// # Errors
    ///
    /// Returns [`AnnounceError::NoRelays`] when the first cycle finds no
    /// relay; the background loop still starts and retries.
    pub async fn start(&self) -> Result<(), AnnounceError> {
        if self.inner.stop.is_cancelled() {
            return Err(AnnounceError::Stopped);
        }
        let first = self.inner.cycle().await;
        if let Err(e) = &first {
            tracing::warn!("initial announce failed: {}", e);
        }

        let inner = Arc::clone(&self.inner);
        let announced = first.is_ok();
        let task = tokio::spawn(async move { inner.run(announced).await });
        let previous = self.inner.state().task.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        first
    }

    /// Current relays.
    #[must_use]
    pub fn relays(&self) -> Vec<Relay> {
        self.inner.state().relays.clone()
    }

    /// Current relay addresses.
    #[must_use]
    pub fn relay_addresses(&self) -> Vec<SocketAddrV4> {
        self.inner.state().relays.iter().map(|r| r.addr).collect()
    }

    /// Cut the current ping round short and announce again.
    pub fn refresh(&self) {
        self.inner.refresh.notify_one();
    }

    /// Completed cycle counter.
    #[must_use]
    pub fn subscribe_cycles(&self) -> watch::Receiver<u64> {
        self.inner.cycles.subscribe()
    }

    /// Nodes holding the record from the last cycle, relays included.
    #[must_use]
    pub fn committed(&self) -> Vec<Relay> {
        self.inner.state().committed.clone()
    }

    /// Stop the loop and unannounce every node that accepted the record in
    /// recent cycles.
    pub async fn stop(&self) {
        if !self.inner.stop.cancel() {
            return;
        }
        let (task, known) = {
            let mut state = self.inner.state();
            let mut known: Vec<Relay> = Vec::new();
            for relay in state.history.iter().flatten().chain(state.committed.iter()) {
                if !known.iter().any(|k| k.addr == relay.addr) {
                    known.push(*relay);
                }
            }
            state.relays.clear();
            state.committed.clear();
            state.history.clear();
            (state.task.take(), known)
        };
        if let Some(task) = task {
            task.abort();
        }
        self.inner.unannounce_all(known).await;
        tracing::debug!("announcer for {} stopped", hex::encode(&self.inner.target[..8]));
    }

    /// Whether [`Announcer::stop`] ran.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }
}

impl std::fmt::Debug for Announcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcer")
            .field("target", &hex::encode(&self.inner.target[..8]))
            .field("relays", &self.relay_addresses())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, announced: bool) {
        let token = self.stop.token();
        let mut announced = announced;
        loop {
            if announced {
                self.keep_alive(&token).await;
            } else if !token.pause(self.config.retry_backoff).await {
                return;
            }
            if token.is_cancelled() {
                return;
            }
            announced = match self.cycle().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("announce cycle failed: {}", e);
                    false
                }
            };
        }
    }

    /// Ping relays until the round is spent, a relay stops answering, a
    /// refresh is requested or the announcer stops.
    async fn keep_alive(&self, token: &CancelToken) {
        for _ in 0..self.config.pings_per_cycle {
            tokio::select! {
                alive = token.pause(self.config.ping_interval) => {
                    if !alive {
                        return;
                    }
                }
                () = self.refresh.notified() => return,
            }
            let relays = self.state().relays.clone();
            for relay in relays {
                let ping = self
                    .dht
                    .request(None, Command::Ping, None, relay.addr, RequestOptions::default())
                    .await;
                if let Err(e) = ping {
                    tracing::debug!("relay {} stopped answering: {}", relay.addr, e);
                    return;
                }
            }
        }
    }

    async fn cycle(&self) -> Result<(), AnnounceError> {
        if self.stop.is_cancelled() {
            return Err(AnnounceError::Stopped);
        }
        let replies = collect(self.dht.query(self.target, Command::Lookup, None)).await;
        let candidates: Vec<(SocketAddrV4, [u8; 32], [u8; 32])> = replies
            .iter()
            .filter_map(|r: &QueryReply| Some((r.from.addr, r.from.id?, r.token?)))
            .take(self.config.commit_fanout)
            .collect();

        let (previous, committed) = {
            let state = self.state();
            (state.relays.clone(), state.committed.clone())
        };
        let record = PeerRecord {
            public_key: self.keys.public_key(),
            relay_addresses: previous.iter().map(|r| r.addr).collect(),
            timestamp: unix_now(),
        };

        let mut commits = JoinSet::new();
        for (addr, id, token) in candidates {
            let value = self.sign(&self.ns.announce, &record, &id, &token);
            let dht = Arc::clone(&self.dht);
            let target = self.target;
            commits.spawn(async move {
                let options = RequestOptions {
                    socket: None,
                    token: Some(token),
                };
                dht.request(Some(target), Command::Announce, Some(value), addr, options)
                    .await
                    .map(|_| Relay { addr, id, token })
            });
        }

        let mut accepted = Vec::new();
        while let Some(joined) = commits.join_next().await {
            match joined {
                Ok(Ok(relay)) => accepted.push(relay),
                Ok(Err(e)) => tracing::trace!("announce commit failed: {}", e),
                Err(_) => {}
            }
        }
        if self.stop.is_cancelled() {
            self.unannounce_all(accepted).await;
            return Err(AnnounceError::Stopped);
        }
        if accepted.is_empty() {
            return Err(AnnounceError::NoRelays);
        }
        let relays: Vec<Relay> = accepted.iter().take(self.config.max_relays).copied().collect();

        let dropped: Vec<Relay> = committed
            .into_iter()
            .filter(|old| !accepted.iter().any(|r| r.addr == old.addr))
            .collect();
        let cycle = {
            let mut state = self.state();
            state.history.push_back(accepted.clone());
            while state.history.len() > self.config.history {
                state.history.pop_front();
            }
            state.relays = relays.clone();
            state.committed = accepted;
            state.cycles += 1;
            state.cycles
        };

        if let Some(router) = &self.router {
            router.set_local_record(
                &self.target,
                PeerRecord {
                    relay_addresses: relays.iter().map(|r| r.addr).collect(),
                    ..record
                },
            );
        }
        tracing::debug!(
            "announce cycle {} for {}: {} relays, {} dropped",
            cycle,
            hex::encode(&self.target[..8]),
            relays.len(),
            dropped.len()
        );
        self.unannounce_all(dropped).await;
        self.cycles.send_replace(cycle);
        Ok(())
    }

    async fn unannounce_all(&self, relays: Vec<Relay>) {
        if relays.is_empty() {
            return;
        }
        let record = PeerRecord {
            public_key: self.keys.public_key(),
            relay_addresses: Vec::new(),
            timestamp: unix_now(),
        };
        let mut pending = JoinSet::new();
        for relay in relays {
            let value = self.sign(&self.ns.unannounce, &record, &relay.id, &relay.token);
            let dht = Arc::clone(&self.dht);
            let target = self.target;
            pending.spawn(async move {
                let options = RequestOptions {
                    socket: None,
                    token: Some(relay.token),
                };
                if let Err(e) = dht
                    .request(Some(target), Command::Unannounce, Some(value), relay.addr, options)
                    .await
                {
                    tracing::trace!("unannounce at {} failed: {}", relay.addr, e);
                }
            });
        }
        while pending.join_next().await.is_some() {}
    }

    fn sign(&self, namespace: &[u8; 32], record: &PeerRecord, id: &[u8; 32], token: &[u8; 32]) -> Vec<u8> {
        let peer = record.encode();
        let digest = signable(namespace, &self.target, token, id, &peer, None);
        AnnounceMessage {
            peer: record.clone(),
            refresh: None,
            signature: self.keys.sign(&digest),
        }
        .encode()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
