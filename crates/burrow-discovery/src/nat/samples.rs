//! Ranked address observations and the classification rules over them.

use super::{Firewall, NatConfig};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

/// One observed external address and how often it was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatSample {
    /// External host
    pub host: Ipv4Addr,
    /// External port, `0` when only the host is meaningful
    pub port: u16,
    /// Number of reports
    pub hits: u32,
}

impl NatSample {
    /// The sample as a socket address.
    #[must_use]
    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }
}

/// Sample bookkeeping for one socket.
///
/// Pure state with no I/O; [`super::NatClassifier`] drives it.
#[derive(Debug, Clone)]
pub struct NatSamples {
    config: NatConfig,
    firewalled: bool,
    by_host: Vec<NatSample>,
    by_addr: Vec<NatSample>,
    visited: HashSet<SocketAddrV4>,
    sampled: usize,
    firewall: Firewall,
    addresses: Vec<NatSample>,
    frozen: bool,
}

impl NatSamples {
    /// Empty sample set. A node that is not firewalled is `Open` from the start.
    #[must_use]
    pub fn new(config: NatConfig, firewalled: bool) -> Self {
        Self {
            config,
            firewalled,
            by_host: Vec::new(),
            by_addr: Vec::new(),
            visited: HashSet::new(),
            sampled: 0,
            firewall: if firewalled {
                Firewall::Unknown
            } else {
                Firewall::Open
            },
            addresses: Vec::new(),
            frozen: false,
        }
    }

    /// Record that `referrer` saw us at `observed`.
    ///
    /// Returns `false` if `referrer` already contributed a sample.
    pub fn add(&mut self, observed: SocketAddrV4, referrer: SocketAddrV4) -> bool {
        if !self.visited.insert(referrer) {
            return false;
        }
        self.sampled += 1;
        bump(&mut self.by_host, *observed.ip(), 0);
        bump(&mut self.by_addr, *observed.ip(), observed.port());
        if !self.frozen {
            self.classify();
        }
        true
    }

    /// Current classification.
    #[must_use]
    pub fn firewall(&self) -> Firewall {
        self.firewall
    }

    /// External addresses backing the classification.
    #[must_use]
    pub fn addresses(&self) -> &[NatSample] {
        &self.addresses
    }

    /// Number of accepted samples.
    #[must_use]
    pub fn sampled(&self) -> usize {
        self.sampled
    }

    /// Thresholds in use.
    #[must_use]
    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Samples still needed to reach the budget.
    #[must_use]
    pub fn missing(&self) -> usize {
        self.config.min_samples.saturating_sub(self.sampled)
    }

    /// Whether `referrer` already contributed.
    #[must_use]
    pub fn has_visited(&self, referrer: &SocketAddrV4) -> bool {
        self.visited.contains(referrer)
    }

    /// Whether the classification can no longer change or enough samples arrived.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.firewall.is_stable() || self.sampled >= self.config.min_samples
    }

    /// Lower the sample budget so waiters resolve immediately.
    pub fn exhaust(&mut self) {
        self.config.min_samples = 0;
    }

    /// Keep collecting samples but stop reclassifying.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Resume classification and apply what arrived while frozen.
    pub fn unfreeze(&mut self) {
        self.frozen = false;
        self.classify();
    }

    /// Forget every sample, keeping the configuration.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone(), self.firewalled);
    }

    /// Override the classification of a reachable node.
    pub fn set_open(&mut self, addr: SocketAddrV4) {
        self.firewalled = false;
        self.firewall = Firewall::Open;
        self.addresses = vec![NatSample {
            host: *addr.ip(),
            port: addr.port(),
            hits: 0,
        }];
    }

    fn classify(&mut self) {
        let Some((firewall, addresses)) = self.verdict() else {
            return;
        };
        if firewall.rank() < self.firewall.rank() {
            return;
        }
        self.firewall = firewall;
        self.addresses = addresses;
    }

    fn verdict(&self) -> Option<(Firewall, Vec<NatSample>)> {
        if !self.firewalled || self.sampled < self.config.classify_after {
            return None;
        }
        let top = *self.by_addr.first()?;

        if top.hits >= self.config.consistent_hits {
            let mut addresses: Vec<NatSample> = self
                .by_addr
                .iter()
                .filter(|s| s.hits >= 2)
                .take(2)
                .copied()
                .collect();
            if !addresses.contains(&top) {
                addresses.insert(0, top);
            }
            return Some((Firewall::Consistent, addresses));
        }

        let host = self.by_host[0];
        if top.hits == 1 {
            return Some((Firewall::Random, vec![host]));
        }

        if top.hits == 2 && self.by_host.len() == 1 && self.sampled > self.config.classify_after {
            return Some((Firewall::Random, vec![host]));
        }

        if self.by_addr.get(1).is_some_and(|second| second.hits > 1) {
            return Some((Firewall::Consistent, self.by_addr[..2].to_vec()));
        }

        if self.sampled > self.config.random_fallback_after {
            return Some((Firewall::Random, vec![host]));
        }

        None
    }
}

/// Increment a ranked entry, keeping the list sorted by hits.
fn bump(list: &mut Vec<NatSample>, host: Ipv4Addr, port: u16) {
    let index = match list.iter().position(|s| s.host == host && s.port == port) {
        Some(index) => {
            list[index].hits += 1;
            index
        }
        None => {
            list.push(NatSample { host, port, hits: 1 });
            list.len() - 1
        }
    };
    let mut i = index;
    while i > 0 && list[i - 1].hits < list[i].hits {
        list.swap(i - 1, i);
        i -= 1;
    }
}
