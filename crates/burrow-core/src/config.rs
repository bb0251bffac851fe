//! Node configuration

use burrow_discovery::{AnnouncerConfig, ForwardConfig, NatConfig, PairConfig};
use burrow_transport::PoolConfig;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Socket pool
    pub pool: PoolConfig,

    /// NAT classifier thresholds
    pub nat: NatConfig,

    /// Holepunch pair timing
    pub pair: PairConfig,

    /// Router forward table bounds
    pub forwards: ForwardConfig,

    /// Announce cadence of listening servers
    pub announcer: AnnouncerConfig,

    /// Responder side
    pub server: ServerConfig,

    /// Initiator side
    pub client: ClientConfig,

    /// Node maintenance
    pub maintenance: MaintenanceConfig,
}

impl NodeConfig {
    /// Configuration for nodes that only talk over loopback: sockets bind
    /// to `127.0.0.1` and every timer is shortened.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            pool: PoolConfig {
                bind_host: Ipv4Addr::LOCALHOST,
                ..PoolConfig::default()
            },
            pair: PairConfig {
                remote_unknown_wait: Duration::from_millis(100),
                analyze_timeout: Duration::from_secs(1),
                consistent_interval: Duration::from_millis(100),
                responder_delay: Duration::from_millis(20),
                random_interval: Duration::from_millis(5),
                birthday_interval: Duration::from_millis(5),
                ..PairConfig::default()
            },
            announcer: AnnouncerConfig {
                ping_interval: Duration::from_millis(200),
                retry_backoff: Duration::from_millis(200),
                ..AnnouncerConfig::default()
            },
            server: ServerConfig {
                handshake_timeout: Duration::from_secs(5),
                gc_interval: Duration::from_millis(500),
                ..ServerConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Responder configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Handshakes older than this are forgotten by the GC sweep
    pub handshake_timeout: Duration,

    /// Period of the GC sweep
    pub gc_interval: Duration,

    /// Pairing timer armed after the handshake
    pub pair_timeout: Duration,

    /// Pairing timer re-armed once punching starts
    pub punch_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(20),
            gc_interval: Duration::from_secs(5),
            pair_timeout: Duration::from_secs(6),
            punch_timeout: Duration::from_secs(40),
        }
    }
}

/// Initiator configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pairing timer armed when the pair opens
    pub pairing_timeout: Duration,

    /// Pairing timer re-armed after the handshake when dialling directly
    pub connected_timeout: Duration,

    /// Pairing timer re-armed once punching starts
    pub punch_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(10),
            connected_timeout: Duration::from_secs(6),
            punch_timeout: Duration::from_secs(40),
        }
    }
}

/// Background upkeep of a node
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often expired router forwards are dropped
    pub forward_cleanup_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            forward_cleanup_interval: Duration::from_secs(60),
        }
    }
}
