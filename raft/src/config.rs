use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::msg::{
    ELECTION_TIMEOUT_MS_HIGH, ELECTION_TIMEOUT_MS_LOW, HEARTBEAT_INTERVAL_MS, RPC_TIMEOUT_MS,
};

/// Tunables for a single node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Election timeout is drawn uniformly from `[min, max)` on every reset.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Must stay below `election_timeout_min_ms`.
    pub heartbeat_interval_ms: u64,
    /// Upper bound on any single outbound RPC. Must stay below `election_timeout_min_ms`.
    pub rpc_timeout_ms: u64,
    /// The log is compacted once more than this many applied entries follow the last snapshot.
    pub snapshot_threshold: u64,
    pub max_entries_per_append: usize,
    /// How long a redirecting client waits when no leader is known.
    pub no_leader_retry_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: ELECTION_TIMEOUT_MS_LOW,
            election_timeout_max_ms: ELECTION_TIMEOUT_MS_HIGH,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            rpc_timeout_ms: RPC_TIMEOUT_MS,
            snapshot_threshold: 1000,
            max_entries_per_append: 64,
            no_leader_retry_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(RaftError::InvalidEngineConfig(msg.to_string()));
        if self.election_timeout_min_ms == 0 || self.heartbeat_interval_ms == 0 {
            return invalid("timeouts must be non-zero");
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return invalid("election_timeout_min_ms must be below election_timeout_max_ms");
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return invalid("heartbeat_interval_ms must be below election_timeout_min_ms");
        }
        if self.rpc_timeout_ms == 0 {
            return invalid("rpc_timeout_ms must be non-zero");
        }
        if self.rpc_timeout_ms >= self.election_timeout_min_ms {
            return invalid("rpc_timeout_ms must be below election_timeout_min_ms");
        }
        if self.snapshot_threshold == 0 {
            return invalid("snapshot_threshold must be non-zero");
        }
        if self.max_entries_per_append == 0 {
            return invalid("max_entries_per_append must be non-zero");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn no_leader_retry_interval(&self) -> Duration {
        Duration::from_millis(self.no_leader_retry_interval_ms)
    }
}
