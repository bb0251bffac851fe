//! Configuration file for the burrow CLI.

use burrow_core::NodeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Burrow configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Identity
    pub identity: IdentityConfig,
    /// Sockets
    pub network: NetworkConfig,
    /// NAT classification
    pub nat: NatSection,
    /// Holepunch timing
    pub holepunch: HolepunchSection,
    /// Responder side
    pub server: ServerSection,
    /// Initiator side
    pub client: ClientSection,
    /// Announcing
    pub announce: AnnounceSection,
    /// Logging
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// File holding the hex-encoded key seed
    pub key_file: PathBuf,
}

/// Socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host new sockets bind to
    pub bind_host: String,
    /// Sockets kept alive after release
    pub linger_max: usize,
    /// How long released sockets linger
    pub linger_secs: u64,
}

/// NAT classifier thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatSection {
    /// Samples before `analyzing` resolves
    pub min_samples: usize,
    /// Hits proving a consistent mapping
    pub consistent_hits: u32,
    /// Samples before any verdict
    pub classify_after: usize,
    /// Samples before falling back to random
    pub random_fallback_after: usize,
}

/// Holepunch timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolepunchSection {
    /// Round one retries
    pub max_reopens: usize,
    /// Upper bound on local classification, in milliseconds
    pub analyze_timeout_ms: u64,
    /// Probes sprayed at random ports
    pub random_probes: usize,
    /// Sockets opened by the birthday strategy
    pub birthday_sockets: usize,
}

/// Responder timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Handshake lifetime in seconds
    pub handshake_timeout_secs: u64,
    /// GC period in seconds
    pub gc_interval_secs: u64,
}

/// Initiator timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Pairing timer in seconds
    pub pairing_timeout_secs: u64,
    /// Direct dial timer in seconds
    pub connected_timeout_secs: u64,
    /// Punching timer in seconds
    pub punch_timeout_secs: u64,
}

/// Announce cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnounceSection {
    /// Relays kept per cycle
    pub max_relays: usize,
    /// Gap between relay pings in seconds
    pub ping_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".burrow/identity")
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_path(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let pool = NodeConfig::default().pool;
        Self {
            bind_host: pool.bind_host.to_string(),
            linger_max: pool.linger_max,
            linger_secs: pool.linger_time.as_secs(),
        }
    }
}

impl Default for NatSection {
    fn default() -> Self {
        let nat = NodeConfig::default().nat;
        Self {
            min_samples: nat.min_samples,
            consistent_hits: nat.consistent_hits,
            classify_after: nat.classify_after,
            random_fallback_after: nat.random_fallback_after,
        }
    }
}

impl Default for HolepunchSection {
    fn default() -> Self {
        let pair = NodeConfig::default().pair;
        Self {
            max_reopens: pair.max_reopens,
            analyze_timeout_ms: millis(pair.analyze_timeout),
            random_probes: pair.random_probes,
            birthday_sockets: pair.birthday_sockets,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = NodeConfig::default().server;
        Self {
            handshake_timeout_secs: server.handshake_timeout.as_secs(),
            gc_interval_secs: server.gc_interval.as_secs(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        let client = NodeConfig::default().client;
        Self {
            pairing_timeout_secs: client.pairing_timeout.as_secs(),
            connected_timeout_secs: client.connected_timeout.as_secs(),
            punch_timeout_secs: client.punch_timeout.as_secs(),
        }
    }
}

impl Default for AnnounceSection {
    fn default() -> Self {
        let announcer = NodeConfig::default().announcer;
        Self {
            max_relays: announcer.max_relays,
            ping_interval_secs: announcer.ping_interval.as_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load `path` if it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("burrow/config.toml")
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.network
            .bind_host
            .parse::<Ipv4Addr>()
            .map_err(|_| anyhow::anyhow!("Invalid bind host: {}", self.network.bind_host))?;

        if self.nat.classify_after == 0 || self.nat.min_samples < self.nat.classify_after {
            anyhow::bail!("nat.min_samples must be at least nat.classify_after, which must be positive");
        }
        if self.announce.max_relays == 0 || self.announce.max_relays > 3 {
            anyhow::bail!("announce.max_relays must be between 1 and 3");
        }
        if self.holepunch.birthday_sockets == 0 || self.holepunch.birthday_sockets > 1024 {
            anyhow::bail!("holepunch.birthday_sockets must be between 1 and 1024");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }

    /// Node configuration with the file's overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind host does not parse.
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::default();

        config.pool.bind_host = self.network.bind_host.parse()?;
        config.pool.linger_max = self.network.linger_max;
        config.pool.linger_time = Duration::from_secs(self.network.linger_secs);

        config.nat.min_samples = self.nat.min_samples;
        config.nat.consistent_hits = self.nat.consistent_hits;
        config.nat.classify_after = self.nat.classify_after;
        config.nat.random_fallback_after = self.nat.random_fallback_after;

        config.pair.max_reopens = self.holepunch.max_reopens;
        config.pair.analyze_timeout = Duration::from_millis(self.holepunch.analyze_timeout_ms);
        config.pair.random_probes = self.holepunch.random_probes;
        config.pair.birthday_sockets = self.holepunch.birthday_sockets;

        config.server.handshake_timeout = Duration::from_secs(self.server.handshake_timeout_secs);
        config.server.gc_interval = Duration::from_secs(self.server.gc_interval_secs);

        config.client.pairing_timeout = Duration::from_secs(self.client.pairing_timeout_secs);
        config.client.connected_timeout = Duration::from_secs(self.client.connected_timeout_secs);
        config.client.punch_timeout = Duration::from_secs(self.client.punch_timeout_secs);

        config.announcer.max_relays = self.announce.max_relays;
        config.announcer.ping_interval = Duration::from_secs(self.announce.ping_interval_secs);
        Ok(config)
    }
}
