//! NAT classification.
//!
//! A node learns how its NAT maps ports by asking several DHT nodes which
//! address they saw a request come from. The answers are ranked by how often
//! each address (and each host) recurs:
//!
//! | Observation | Classification |
//! |-------------|----------------|
//! | node is not firewalled | `Open` |
//! | one address seen three or more times | `Consistent` |
//! | every sample carried a different port | `Random` |
//! | two addresses seen twice each | `Consistent` |
//! | more than four samples without agreement | `Random` |
//!
//! Once `Consistent` or `Open` the classification never regresses.

pub mod classifier;
pub mod samples;

pub use classifier::{NatClassifier, NatSnapshot};
pub use samples::{NatSample, NatSamples};

use std::fmt;

/// How a node's NAT maps outbound flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Firewall {
    /// Not classified yet
    #[default]
    Unknown = 0,
    /// Publicly reachable, no NAT in the way
    Open = 1,
    /// Same external port for every destination
    Consistent = 2,
    /// A fresh external port per destination
    Random = 3,
}

impl Firewall {
    /// Parse the wire byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Open),
            2 => Some(Self::Consistent),
            3 => Some(Self::Random),
            _ => None,
        }
    }

    /// Whether the external port can be predicted from one observation.
    #[must_use]
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Open | Self::Consistent)
    }

    /// Ordering used to keep classifications monotonic.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Random => 1,
            Self::Consistent => 2,
            Self::Open => 3,
        }
    }
}

impl fmt::Display for Firewall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Open => write!(f, "Open"),
            Self::Consistent => write!(f, "Consistent"),
            Self::Random => write!(f, "Random"),
        }
    }
}

/// Thresholds of the classifier.
#[derive(Debug, Clone)]
pub struct NatConfig {
    /// Samples after which `analyzing` resolves even without a verdict
    pub min_samples: usize,
    /// Hits on one address that prove a consistent mapping
    pub consistent_hits: u32,
    /// Samples needed before any verdict; more than this many double hits
    /// on a single host count as `Random`
    pub classify_after: usize,
    /// Samples after which any undecided state falls back to `Random`
    pub random_fallback_after: usize,
    /// Extra sampling rounds when the first one comes up short
    pub sample_retries: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            min_samples: 4,
            consistent_hits: 3,
            classify_after: 3,
            random_fallback_after: 4,
            sample_retries: 1,
        }
    }
}
