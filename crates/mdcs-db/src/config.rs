//! Store configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one namespace store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of this replica, used in log fields.
    pub replica_id: String,
    /// Broadcast topic. Defaults to the namespace key when unset.
    pub topic: Option<String>,
    /// Timeout for a single DAG call (in milliseconds).
    pub dag_timeout_ms: u64,
    /// Timeout for publishing a new head (in milliseconds).
    pub broadcast_timeout_ms: u64,
    /// Maximum number of ancestor levels walked when repairing a gap.
    pub max_walk_depth: usize,
    /// Verdict for elements no filter pattern matches.
    pub accept_by_default: bool,
    /// Number of stripes in the per-key lock table.
    pub key_lock_stripes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replica_id: "replica".to_string(),
            topic: None,
            dag_timeout_ms: 5000,
            broadcast_timeout_ms: 2000,
            max_walk_depth: 1000,
            accept_by_default: true,
            key_lock_stripes: 64,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from TOML. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a configuration file written in TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::error::DbError::Config(format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn dag_timeout(&self) -> Duration {
        Duration::from_millis(self.dag_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
}

/// Builder for store configuration.
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
        }
    }

    pub fn replica_id(mut self, id: impl Into<String>) -> Self {
        self.config.replica_id = id.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = Some(topic.into());
        self
    }

    pub fn dag_timeout(mut self, ms: u64) -> Self {
        self.config.dag_timeout_ms = ms;
        self
    }

    pub fn broadcast_timeout(mut self, ms: u64) -> Self {
        self.config.broadcast_timeout_ms = ms;
        self
    }

    pub fn max_walk_depth(mut self, depth: usize) -> Self {
        self.config.max_walk_depth = depth;
        self
    }

    pub fn accept_by_default(mut self, accept: bool) -> Self {
        self.config.accept_by_default = accept;
        self
    }

    pub fn key_lock_stripes(mut self, stripes: usize) -> Self {
        self.config.key_lock_stripes = stripes.max(1);
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
