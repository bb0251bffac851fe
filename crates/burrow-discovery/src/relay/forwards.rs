//! Forward table: which targets this node can reach and how.

use super::PeerHandler;
use crate::messages::PeerRecord;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounds of the forward table.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Most relayed entries kept
    pub max_forwards: usize,
    /// How long an announce keeps a relayed entry alive
    pub ttl: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_forwards: 10_000,
            ttl: Duration::from_secs(20 * 60),
        }
    }
}

/// How a target is reached.
#[derive(Clone)]
pub enum Forward {
    /// The server runs on this node
    Local {
        /// Answers handshakes and holepunches
        handler: Arc<dyn PeerHandler>,
        /// Record to hand out on `FindPeer`, once announced
        record: Option<PeerRecord>,
    },
    /// The server announced itself to us from `relay`
    Relayed {
        /// Where the server's announce came from
        relay: SocketAddrV4,
        /// The announced record
        record: PeerRecord,
        /// Last announce
        refreshed: Instant,
    },
}

impl Forward {
    /// Record to answer `FindPeer` with.
    #[must_use]
    pub fn record(&self) -> Option<&PeerRecord> {
        match self {
            Self::Local { record, .. } => record.as_ref(),
            Self::Relayed { record, .. } => Some(record),
        }
    }

    fn is_alive(&self, ttl: Duration) -> bool {
        match self {
            Self::Local { .. } => true,
            Self::Relayed { refreshed, .. } => refreshed.elapsed() < ttl,
        }
    }
}

impl std::fmt::Debug for Forward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { record, .. } => f
                .debug_struct("Local")
                .field("announced", &record.is_some())
                .finish_non_exhaustive(),
            Self::Relayed { relay, refreshed, .. } => f
                .debug_struct("Relayed")
                .field("relay", relay)
                .field("age", &refreshed.elapsed())
                .finish_non_exhaustive(),
        }
    }
}

/// Target-keyed forwards. Local entries never expire; relayed ones live
/// for `ttl` after their last announce.
#[derive(Debug)]
pub struct ForwardTable {
    entries: HashMap<[u8; 32], Forward>,
    config: ForwardConfig,
}

impl ForwardTable {
    /// Empty table.
    #[must_use]
    pub fn new(config: ForwardConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
        }
    }

    /// Live entry for `target`.
    #[must_use]
    pub fn get(&self, target: &[u8; 32]) -> Option<&Forward> {
        self.entries
            .get(target)
            .filter(|f| f.is_alive(self.config.ttl))
    }

    /// Register a server running on this node.
    pub fn set_local(&mut self, target: [u8; 32], handler: Arc<dyn PeerHandler>) {
        self.entries.insert(target, Forward::Local { handler, record: None });
    }

    /// Attach the record a local server announced. Ignored for other targets.
    pub fn set_local_record(&mut self, target: &[u8; 32], record: PeerRecord) {
        if let Some(Forward::Local { record: slot, .. }) = self.entries.get_mut(target) {
            *slot = Some(record);
        }
    }

    /// Drop a local server.
    pub fn remove_local(&mut self, target: &[u8; 32]) -> bool {
        if matches!(self.entries.get(target), Some(Forward::Local { .. })) {
            self.entries.remove(target);
            return true;
        }
        false
    }

    /// Store or refresh an announced record. A local server always wins.
    pub fn announce(&mut self, target: [u8; 32], relay: SocketAddrV4, record: PeerRecord) -> bool {
        if matches!(self.entries.get(&target), Some(Forward::Local { .. })) {
            return false;
        }
        if !self.entries.contains_key(&target) && self.relayed_len() >= self.config.max_forwards {
            self.evict();
        }
        self.entries.insert(
            target,
            Forward::Relayed {
                relay,
                record,
                refreshed: Instant::now(),
            },
        );
        true
    }

    /// Remove an announced record.
    pub fn unannounce(&mut self, target: &[u8; 32]) -> bool {
        if matches!(self.entries.get(target), Some(Forward::Relayed { .. })) {
            self.entries.remove(target);
            return true;
        }
        false
    }

    /// Drop expired relayed entries.
    pub fn cleanup(&mut self) -> usize {
        let ttl = self.config.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, f| f.is_alive(ttl));
        before - self.entries.len()
    }

    /// Entries of either kind.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn relayed_len(&self) -> usize {
        self.entries
            .values()
            .filter(|f| matches!(f, Forward::Relayed { .. }))
            .count()
    }

    fn evict(&mut self) {
        if self.cleanup() > 0 {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .filter_map(|(target, f)| match f {
                Forward::Relayed { refreshed, .. } => Some((*target, *refreshed)),
                Forward::Local { .. } => None,
            })
            .min_by_key(|(_, refreshed)| *refreshed)
            .map(|(target, _)| target);
        if let Some(target) = oldest {
            tracing::trace!("forward table full, evicting {}", hex::encode(&target[..8]));
            self.entries.remove(&target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use burrow_crypto::KeyPair;

    struct Nobody;

    #[async_trait]
    impl PeerHandler for Nobody {
        async fn on_handshake(&self, _noise: Vec<u8>, _peer: SocketAddrV4) -> Option<Vec<u8>> {
            None
        }

        async fn on_holepunch(&self, _id: u64, _payload: Vec<u8>, _peer: SocketAddrV4) -> Option<Vec<u8>> {
            None
        }
    }

    fn record(seed: u8) -> PeerRecord {
        PeerRecord {
            public_key: KeyPair::from_seed(&[seed; 32]).public_key(),
            relay_addresses: Vec::new(),
            timestamp: 0,
        }
    }

    fn relay() -> SocketAddrV4 {
        "10.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_local_wins_over_announce() {
        let mut table = ForwardTable::new(ForwardConfig::default());
        table.set_local([1; 32], Arc::new(Nobody));
        assert!(!table.announce([1; 32], relay(), record(1)));
        assert!(matches!(table.get(&[1; 32]), Some(Forward::Local { .. })));
        assert!(!table.unannounce(&[1; 32]));
        assert!(table.get(&[1; 32]).unwrap().record().is_none());

        table.set_local_record(&[1; 32], record(1));
        assert!(table.get(&[1; 32]).unwrap().record().is_some());
        assert!(table.remove_local(&[1; 32]));
        assert!(table.is_empty());
    }

    #[test]
    fn test_relayed_entries_expire() {
        let mut table = ForwardTable::new(ForwardConfig {
            max_forwards: 10,
            ttl: Duration::ZERO,
        });
        table.set_local([1; 32], Arc::new(Nobody));
        assert!(table.announce([2; 32], relay(), record(2)));
        assert!(table.get(&[2; 32]).is_none());
        assert!(table.get(&[1; 32]).is_some());
        assert_eq!(table.cleanup(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_evicts_oldest() {
        let mut table = ForwardTable::new(ForwardConfig {
            max_forwards: 2,
            ttl: Duration::from_secs(60),
        });
        table.set_local([9; 32], Arc::new(Nobody));
        table.announce([1; 32], relay(), record(1));
        std::thread::sleep(Duration::from_millis(2));
        table.announce([2; 32], relay(), record(2));
        table.announce([3; 32], relay(), record(3));

        assert!(table.get(&[1; 32]).is_none());
        assert!(table.get(&[2; 32]).is_some());
        assert!(table.get(&[3; 32]).is_some());
        assert!(table.get(&[9; 32]).is_some());
    }

    #[test]
    fn test_reannounce_refreshes() {
        let mut table = ForwardTable::new(ForwardConfig {
            max_forwards: 1,
            ttl: Duration::from_secs(60),
        });
        table.announce([1; 32], relay(), record(1));
        let moved: SocketAddrV4 = "10.0.0.2:4000".parse().unwrap();
        table.announce([1; 32], moved, record(1));
        assert_eq!(table.len(), 1);
        assert!(matches!(table.get(&[1; 32]), Some(Forward::Relayed { relay, .. }) if *relay == moved));
        assert!(table.unannounce(&[1; 32]));
        assert!(!table.unannounce(&[1; 32]));
    }
}
