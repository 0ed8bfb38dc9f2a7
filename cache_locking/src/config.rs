// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration for locking, deadlock detection and cluster timeouts.
//!
//! Every field carries a serde default so partial documents deserialize.
//! [`LockingConfig::validate`] checks the relationships between timeouts and
//! reports violations as warnings; only values that make a component
//! impossible to build are hard errors.

use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};

/// How the cache spreads entries across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Single node, no transport.
    #[default]
    Local,
    /// Every node holds every entry.
    Replicated,
    /// Entries live on `num_owners` nodes chosen by the consistent hash.
    Distributed,
    /// Entries are invalidated rather than replicated.
    Invalidation,
}

impl CacheMode {
    pub fn is_clustered(self) -> bool {
        !matches!(self, CacheMode::Local)
    }
}

/// Deadlock detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockDetectionConfig {
    /// Run cycle detection for transactional lock acquisitions.
    #[serde(default)]
    pub enabled: bool,

    /// Per-attempt acquisition timeout while spinning, in milliseconds.
    #[serde(default = "default_spin_duration")]
    pub spin_duration_ms: u64,
}

fn default_spin_duration() -> u64 {
    100
}

impl Default for DeadlockDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spin_duration_ms: default_spin_duration(),
        }
    }
}

/// Cluster-wide timeouts the lock timeout is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTimeouts {
    /// Synchronous replication timeout in milliseconds.
    #[serde(default = "default_sync_repl_timeout")]
    pub sync_repl_timeout_ms: u64,

    /// Timeout for cluster-wide synchronization in milliseconds.
    #[serde(default = "default_distributed_sync_timeout")]
    pub distributed_sync_timeout_ms: u64,

    /// Timeout for state transfer in milliseconds.
    #[serde(default = "default_state_retrieval_timeout")]
    pub state_retrieval_timeout_ms: u64,
}

fn default_sync_repl_timeout() -> u64 {
    15_000
}
fn default_distributed_sync_timeout() -> u64 {
    240_000
}
fn default_state_retrieval_timeout() -> u64 {
    240_000
}

impl Default for ClusterTimeouts {
    fn default() -> Self {
        Self {
            sync_repl_timeout_ms: default_sync_repl_timeout(),
            distributed_sync_timeout_ms: default_distributed_sync_timeout(),
            state_retrieval_timeout_ms: default_state_retrieval_timeout(),
        }
    }
}

/// Top-level locking configuration for one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Cache name, used in worker names and log fields.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    #[serde(default)]
    pub cache_mode: CacheMode,

    /// Maximum time a caller blocks waiting for a key lock, in milliseconds.
    #[serde(default = "default_lock_acquisition_timeout")]
    pub lock_acquisition_timeout_ms: u64,

    /// Number of lock stripes.
    #[serde(default = "default_concurrency_level")]
    pub concurrency_level: usize,

    #[serde(default)]
    pub deadlock_detection: DeadlockDetectionConfig,

    /// Record deadlock counters.
    #[serde(default = "default_expose_statistics")]
    pub expose_statistics: bool,

    #[serde(default)]
    pub timeouts: ClusterTimeouts,
}

fn default_cache_name() -> String {
    "___defaultcache".to_string()
}
fn default_lock_acquisition_timeout() -> u64 {
    10_000
}
fn default_concurrency_level() -> usize {
    32
}
fn default_expose_statistics() -> bool {
    true
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            cache_name: default_cache_name(),
            cache_mode: CacheMode::default(),
            lock_acquisition_timeout_ms: default_lock_acquisition_timeout(),
            concurrency_level: default_concurrency_level(),
            deadlock_detection: DeadlockDetectionConfig::default(),
            expose_statistics: default_expose_statistics(),
            timeouts: ClusterTimeouts::default(),
        }
    }
}

/// A timeout relationship that does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Setting whose value is too high.
    pub setting: &'static str,
    pub value_ms: u64,
    /// Setting it must not exceed.
    pub limit_setting: &'static str,
    pub limit_ms: u64,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} cannot be higher than {} which is {}",
            self.setting, self.value_ms, self.limit_setting, self.limit_ms
        )
    }
}

impl LockingConfig {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, ms: u64) -> Self {
        self.lock_acquisition_timeout_ms = ms;
        self
    }

    pub fn with_concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    /// Enable deadlock detection with the given spin duration.
    pub fn with_deadlock_detection(mut self, spin_duration_ms: u64) -> Self {
        self.deadlock_detection = DeadlockDetectionConfig {
            enabled: true,
            spin_duration_ms,
        };
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.expose_statistics = enabled;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ClusterTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Whether ownership reconciliation runs after topology changes.
    pub fn is_distributed(&self) -> bool {
        self.cache_mode == CacheMode::Distributed
    }

    /// Reject values no component can be built from.
    pub fn check(&self) -> Result<()> {
        if self.concurrency_level == 0 {
            return Err(LockError::InvalidConfig(
                "concurrency_level must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Check timeout relationships for clustered caches.
    ///
    /// Each violation is logged and returned; none of them is fatal.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        if !self.cache_mode.is_clustered() {
            return Vec::new();
        }

        let checks = [
            (
                "deadlock_detection.spin_duration_ms",
                self.deadlock_detection.spin_duration_ms,
                "lock_acquisition_timeout_ms",
                self.lock_acquisition_timeout_ms,
            ),
            (
                "lock_acquisition_timeout_ms",
                self.lock_acquisition_timeout_ms,
                "timeouts.sync_repl_timeout_ms",
                self.timeouts.sync_repl_timeout_ms,
            ),
            (
                "timeouts.sync_repl_timeout_ms",
                self.timeouts.sync_repl_timeout_ms,
                "timeouts.distributed_sync_timeout_ms",
                self.timeouts.distributed_sync_timeout_ms,
            ),
            (
                "timeouts.distributed_sync_timeout_ms",
                self.timeouts.distributed_sync_timeout_ms,
                "timeouts.state_retrieval_timeout_ms",
                self.timeouts.state_retrieval_timeout_ms,
            ),
        ];

        let warnings: Vec<ConfigWarning> = checks
            .into_iter()
            .filter(|(_, value, _, limit)| value > limit)
            .map(|(setting, value_ms, limit_setting, limit_ms)| ConfigWarning {
                setting,
                value_ms,
                limit_setting,
                limit_ms,
            })
            .collect();

        for warning in &warnings {
            tracing::warn!(cache = %self.cache_name, "invalid timeout: {}", warning);
        }

        warnings
    }
}
