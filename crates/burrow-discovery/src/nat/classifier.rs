//! Sampling driver around [`NatSamples`].

use super::{Firewall, NatConfig, NatSample, NatSamples};
use crate::dht::{Command, Dht, RequestOptions};
use crate::signal::Cancel;
use burrow_transport::PoolSocket;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Published classifier state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatSnapshot {
    /// Current classification
    pub firewall: Firewall,
    /// External addresses backing it
    pub addresses: Vec<NatSample>,
    /// Accepted samples
    pub sampled: usize,
    /// Whether `analyzing` waiters may proceed
    pub settled: bool,
}

/// NAT classifier for one socket.
///
/// Sampling pings go out from the socket being classified so the replies
/// describe that socket's mapping.
pub struct NatClassifier {
    samples: Mutex<NatSamples>,
    tx: watch::Sender<NatSnapshot>,
    destroyed: Cancel,
}

impl NatClassifier {
    /// New classifier. With `firewalled == false` it is `Open` at once.
    #[must_use]
    pub fn new(config: NatConfig, firewalled: bool) -> Arc<Self> {
        let samples = NatSamples::new(config, firewalled);
        let (tx, _rx) = watch::channel(snapshot_of(&samples));
        Arc::new(Self {
            samples: Mutex::new(samples),
            tx,
            destroyed: Cancel::new(),
        })
    }

    fn samples(&self) -> MutexGuard<'_, NatSamples> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_samples<T>(&self, f: impl FnOnce(&mut NatSamples) -> T) -> T {
        let mut samples = self.samples();
        let out = f(&mut samples);
        let snapshot = snapshot_of(&samples);
        drop(samples);
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            if current.firewall != snapshot.firewall {
                tracing::debug!("nat classified {} -> {}", current.firewall, snapshot.firewall);
            }
            *current = snapshot;
            true
        });
        out
    }

    /// Record one observation. Returns `false` for a repeated referrer.
    pub fn add(&self, observed: SocketAddrV4, referrer: SocketAddrV4) -> bool {
        self.with_samples(|s| s.add(observed, referrer))
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> NatSnapshot {
        self.tx.borrow().clone()
    }

    /// Current classification.
    #[must_use]
    pub fn firewall(&self) -> Firewall {
        self.tx.borrow().firewall
    }

    /// Best external address, if the classification yields one with a port.
    #[must_use]
    pub fn address(&self) -> Option<SocketAddrV4> {
        let state = self.tx.borrow();
        if !state.firewall.is_stable() {
            return None;
        }
        state.addresses.first().map(NatSample::addr)
    }

    /// Host of the best observation, port discarded.
    #[must_use]
    pub fn host(&self) -> Option<SocketAddrV4> {
        self.tx.borrow().addresses.first().map(|s| SocketAddrV4::new(s.host, 0))
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NatSnapshot> {
        self.tx.subscribe()
    }

    /// Resolve once the classification is final or the sample budget is spent.
    pub async fn analyzing(&self) -> NatSnapshot {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|s| s.settled).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Mark the socket as publicly reachable at `addr`.
    pub fn set_open(&self, addr: SocketAddrV4) {
        self.with_samples(|s| s.set_open(addr));
    }

    /// Stop reclassifying while a socket change is in flight.
    pub fn freeze(&self) {
        self.with_samples(NatSamples::freeze);
    }

    /// Resume reclassifying.
    pub fn unfreeze(&self) {
        self.with_samples(NatSamples::unfreeze);
    }

    /// Forget every sample after the underlying socket changed.
    pub fn update(&self) {
        self.with_samples(NatSamples::reset);
    }

    /// Release waiters and stop sampling.
    pub fn destroy(&self) {
        self.destroyed.cancel();
        self.with_samples(NatSamples::exhaust);
    }

    /// Whether [`NatClassifier::destroy`] ran.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    /// Ping sample nodes from `socket` until settled, then give up.
    ///
    /// Failed pings simply do not count. When every round is spent the
    /// budget is exhausted so `analyzing` still resolves.
    pub async fn auto_sample(self: Arc<Self>, dht: Arc<dyn Dht>, socket: Arc<PoolSocket>) {
        let retries = self
            .samples
            .lock()
            .map(|s| s.config().sample_retries)
            .unwrap_or(0);
        let token = self.destroyed.token();

        for round in 0..=retries {
            let (needed, visited) = {
                let Ok(samples) = self.samples.lock() else {
                    return;
                };
                if samples.is_settled() {
                    return;
                }
                (samples.missing(), samples.sampled())
            };

            let candidates: Vec<SocketAddrV4> = dht
                .sample_nodes(needed + visited)
                .into_iter()
                .filter(|node| !self.has_visited(node))
                .take(needed.max(1))
                .collect();
            if candidates.is_empty() {
                break;
            }
            tracing::trace!(
                "nat sampling round {} from {} via {} nodes",
                round,
                socket.local_addr(),
                candidates.len()
            );

            let mut pings = JoinSet::new();
            for node in candidates {
                let dht = Arc::clone(&dht);
                let options = RequestOptions {
                    socket: Some(Arc::clone(&socket)),
                    token: None,
                };
                pings.spawn(async move { dht.request(None, Command::Ping, None, node, options).await });
            }

            loop {
                let next = tokio::select! {
                    next = pings.join_next() => next,
                    () = token.cancelled() => return,
                };
                match next {
                    Some(Ok(Ok(response))) => {
                        self.add(response.to, response.from.addr);
                    }
                    Some(Ok(Err(e))) => tracing::trace!("nat sample ping failed: {}", e),
                    Some(Err(_)) => {}
                    None => break,
                }
            }
        }

        self.with_samples(NatSamples::exhaust);
    }

    fn has_visited(&self, node: &SocketAddrV4) -> bool {
        self.samples().has_visited(node)
    }
}

impl std::fmt::Debug for NatClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatClassifier")
            .field("state", &*self.tx.borrow())
            .finish()
    }
}

fn snapshot_of(samples: &NatSamples) -> NatSnapshot {
    NatSnapshot {
        firewall: samples.firewall(),
        addresses: samples.addresses().to_vec(),
        sampled: samples.sampled(),
        settled: samples.is_settled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_analyzing_resolves_on_consistent() {
        let nat = NatClassifier::new(NatConfig::default(), true);
        let waiter = {
            let nat = Arc::clone(&nat);
            tokio::spawn(async move { nat.analyzing().await })
        };
        for i in 1..=3 {
            nat.add(addr("1.2.3.4:5"), SocketAddrV4::new([10, 0, 0, i].into(), 1));
        }
        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.firewall, Firewall::Consistent);
        assert_eq!(nat.address(), Some(addr("1.2.3.4:5")));
    }

    #[tokio::test]
    async fn test_destroy_releases_waiters() {
        let nat = NatClassifier::new(NatConfig::default(), true);
        let waiter = {
            let nat = Arc::clone(&nat);
            tokio::spawn(async move { nat.analyzing().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        nat.destroy();
        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.firewall, Firewall::Unknown);
        assert!(nat.is_destroyed());
    }

    #[tokio::test]
    async fn test_open_is_settled() {
        let nat = NatClassifier::new(NatConfig::default(), false);
        assert_eq!(nat.analyzing().await.firewall, Firewall::Open);
        nat.set_open(addr("8.8.8.8:4000"));
        assert_eq!(nat.address(), Some(addr("8.8.8.8:4000")));
    }

    #[tokio::test]
    async fn test_random_has_host_only() {
        let nat = NatClassifier::new(NatConfig::default(), true);
        for i in 1..=3u8 {
            nat.add(
                SocketAddrV4::new([1, 2, 3, 4].into(), 100 + u16::from(i)),
                SocketAddrV4::new([10, 0, 0, i].into(), 1),
            );
        }
        assert_eq!(nat.firewall(), Firewall::Random);
        assert_eq!(nat.address(), None);
        assert_eq!(nat.host(), Some(addr("1.2.3.4:0")));
    }

    #[test]
    fn test_update_forgets_samples() {
        let nat = NatClassifier::new(NatConfig::default(), true);
        for i in 1..=3 {
            nat.add(addr("1.2.3.4:5"), SocketAddrV4::new([10, 0, 0, i].into(), 1));
        }
        nat.update();
        let state = nat.snapshot();
        assert_eq!(state.firewall, Firewall::Unknown);
        assert_eq!(state.sampled, 0);
    }

    #[tokio::test]
    async fn test_destroy_after_poisoned_lock() {
        let nat = NatClassifier::new(NatConfig::default(), true);
        let poisoner = Arc::clone(&nat);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.samples.lock().unwrap();
            panic!("poison the sample lock");
        })
        .join();
        assert!(nat.samples.is_poisoned());

        assert!(nat.add(addr("1.2.3.4:1000"), addr("10.0.0.1:1")));
        nat.destroy();
        let state = tokio::time::timeout(Duration::from_secs(1), nat.analyzing())
            .await
            .unwrap();
        assert!(state.settled);
        assert_eq!(state.sampled, 1);
    }
}
