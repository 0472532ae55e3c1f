//! Static per-node configuration
//!
//! A node's configuration is fixed for its lifetime. It can be built in code
//! or loaded from JSON.

use crate::address::{Address, Port};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Own address
    pub address: Address,
    /// Cost of each link, indexed by port. Its length is the neighbor count.
    pub link_costs: Vec<u16>,
    /// Root heartbeat interval
    pub hello_interval_ms: u64,
    /// Time without a root-path refresh before the node claims the root
    pub reelection_interval_ms: u64,
    /// Number of packets released together by the mixer
    pub mixing_factor: usize,
    /// Whether origination may add a random detour
    #[serde(default)]
    pub random_routing: bool,
    /// Warm-up before the first link-state advertisement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_state_delay_ms: Option<u64>,
    /// Re-originate the link-state advertisement at this interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_state_refresh_ms: Option<u64>,
    /// Seed for routing coin flips; entropy when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
}

impl NodeConfig {
    /// Default root heartbeat interval
    pub const DEFAULT_HELLO_MS: u64 = 100;
    /// Default reelection timeout
    pub const DEFAULT_REELECTION_MS: u64 = 500;

    /// Create a configuration with default timers and no mixing
    pub fn new(address: Address, link_costs: Vec<u16>) -> Self {
        Self {
            address,
            link_costs,
            hello_interval_ms: Self::DEFAULT_HELLO_MS,
            reelection_interval_ms: Self::DEFAULT_REELECTION_MS,
            mixing_factor: 1,
            random_routing: false,
            link_state_delay_ms: None,
            link_state_refresh_ms: None,
            rng_seed: None,
        }
    }

    pub fn with_timers(mut self, hello_ms: u64, reelection_ms: u64) -> Self {
        self.hello_interval_ms = hello_ms;
        self.reelection_interval_ms = reelection_ms;
        self
    }

    pub fn with_mixing_factor(mut self, mixing_factor: usize) -> Self {
        self.mixing_factor = mixing_factor;
        self
    }

    pub fn with_random_routing(mut self, enabled: bool) -> Self {
        self.random_routing = enabled;
        self
    }

    pub fn with_link_state_delay(mut self, delay_ms: u64) -> Self {
        self.link_state_delay_ms = Some(delay_ms);
        self
    }

    pub fn with_link_state_refresh(mut self, refresh_ms: u64) -> Self {
        self.link_state_refresh_ms = Some(refresh_ms);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Number of neighbor links
    pub fn neighbor_count(&self) -> usize {
        self.link_costs.len()
    }

    /// Port number of the local user
    pub fn user_port(&self) -> Port {
        self.link_costs.len() as Port
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms)
    }

    pub fn reelection_interval(&self) -> Duration {
        Duration::from_millis(self.reelection_interval_ms)
    }

    /// Quiet period after which the tree is declared converged
    pub fn convergence_window(&self) -> Duration {
        self.reelection_interval() * 2
    }

    /// Silence after which a link's neighbor is forgotten. Longer than the
    /// reelection timeout, since live nodes go quiet while they reelect.
    pub fn neighbor_timeout(&self) -> Duration {
        self.reelection_interval() * 2
    }

    pub fn link_state_delay(&self) -> Duration {
        self.link_state_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.convergence_window())
    }

    pub fn link_state_refresh(&self) -> Option<Duration> {
        self.link_state_refresh_ms.map(Duration::from_millis)
    }

    /// Check the configuration for values the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link_costs.len() >= Port::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "{} neighbors exceeds the port space (max {})",
                self.link_costs.len(),
                Port::MAX as usize - 1
            )));
        }
        if self.mixing_factor == 0 {
            return Err(ConfigError::Invalid(
                "mixing_factor must be at least 1".to_string(),
            ));
        }
        if self.hello_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "hello_interval_ms must be positive".to_string(),
            ));
        }
        if self.reelection_interval_ms <= self.hello_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "reelection interval ({} ms) must exceed hello interval ({} ms)",
                self.reelection_interval_ms, self.hello_interval_ms
            )));
        }
        if self.link_state_refresh_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "link_state_refresh_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}
