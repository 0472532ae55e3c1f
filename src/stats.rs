//! Node statistics and diagnostic reports
//!
//! Counters are plain integers; the node owns its statistics and nothing else
//! writes them.

use crate::address::Address;
use crate::events::DropReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Emitted once the spanning tree stopped changing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    /// Wall-clock time of the declaration
    pub at: DateTime<Utc>,
    /// Time since the node started
    pub since_start_ms: u64,
    pub root: Address,
    pub path_length: u16,
    /// Tree advertisements sent so far
    pub advertisements_sent: u64,
}

/// One completed ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttSample {
    pub peer: Address,
    pub rtt_ms: u64,
}

impl RttSample {
    pub fn rtt(&self) -> Duration {
        Duration::from_millis(self.rtt_ms)
    }
}

/// Drop counters by reason
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounters {
    pub unknown_destination: u64,
    pub no_matching_neighbor: u64,
    pub blocked_port: u64,
    pub unexpected: u64,
}

impl DropCounters {
    pub fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::UnknownDestination => self.unknown_destination += 1,
            DropReason::NoMatchingNeighbor => self.no_matching_neighbor += 1,
            DropReason::BlockedPort => self.blocked_port += 1,
            DropReason::Unexpected => self.unexpected += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.unknown_destination + self.no_matching_neighbor + self.blocked_port + self.unexpected
    }
}

/// Per-node statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub advertisements_sent: u64,
    pub advertisements_received: u64,
    pub tree_changes: u64,
    pub reelections: u64,
    pub neighbors_expired: u64,
    pub lsas_originated: u64,
    pub lsas_accepted: u64,
    pub lsas_forwarded: u64,
    pub floods_forwarded: u64,
    pub packets_originated: u64,
    pub packets_relayed: u64,
    pub packets_delivered: u64,
    pub mix_releases: u64,
    pub send_failures: u64,
    pub drops: DropCounters,
    pub rtt_samples: Vec<RttSample>,
    pub convergence: Vec<ConvergenceReport>,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest convergence report, if any
    pub fn last_convergence(&self) -> Option<&ConvergenceReport> {
        self.convergence.last()
    }

    /// Mean round trip over all samples
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let total: u64 = self.rtt_samples.iter().map(|s| s.rtt_ms).sum();
        Some(Duration::from_millis(total / self.rtt_samples.len() as u64))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
