//! # config
//!
//! why: tune raft timing without recompiling
//! relations: consumed by raft.rs and timer.rs; flattened into binaries' clap parsers
//! what: RaftConfig with builders and validation, ConfigArgs clap/env front end

use std::time::Duration;

use clap::Parser;

use crate::error::{RaftError, Result};

/// Configuration for Raft timing parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftConfig {
    /// Minimum election timeout (default: 400ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 550ms)
    pub election_timeout_max: Duration,
    /// Interval between heartbeats sent by leader (default: 100ms)
    pub heartbeat_interval: Duration,
    /// Upper bound on a single outbound rpc (default: 200ms)
    pub rpc_timeout: Duration,
    /// Capacity of the apply channel the host should create (default: 256)
    pub apply_buffer: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(400),
            election_timeout_max: Duration::from_millis(550),
            heartbeat_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(200),
            apply_buffer: 256,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_apply_buffer(mut self, capacity: usize) -> Self {
        self.apply_buffer = capacity;
        self
    }

    /// Defaults overridden by the `RAFT_*` environment variables, see [`ConfigArgs`]
    pub fn from_env() -> Result<Self> {
        ConfigArgs::try_parse_from([env!("CARGO_PKG_NAME")])
            .map_err(|e| RaftError::InvalidConfig(e.to_string()))?
            .into_config()
    }

    /// Reject timings that would let heartbeats race the election timer
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout min {:?} must be below max {:?}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval.is_zero()
            || self.heartbeat_interval * 3 > self.election_timeout_min
        {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {:?} must be non-zero and at most a third of {:?}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout.is_zero() {
            return Err(RaftError::InvalidConfig("rpc timeout must be non-zero".into()));
        }
        if self.apply_buffer == 0 {
            return Err(RaftError::InvalidConfig("apply buffer must be non-zero".into()));
        }
        Ok(())
    }
}

/// Command-line / environment view of [`RaftConfig`].
///
/// Binaries flatten this into their own `clap` parser; every flag also reads
/// its `RAFT_*` environment variable.
#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    /// Lower bound of the randomized election timeout
    #[arg(long, env = "RAFT_ELECTION_TIMEOUT_MIN_MS", default_value_t = 400)]
    pub election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, env = "RAFT_ELECTION_TIMEOUT_MAX_MS", default_value_t = 550)]
    pub election_timeout_max_ms: u64,

    /// How often a leader sends AppendEntries
    #[arg(long, env = "RAFT_HEARTBEAT_INTERVAL_MS", default_value_t = 100)]
    pub heartbeat_interval_ms: u64,

    /// Give up on an outbound rpc after this long
    #[arg(long, env = "RAFT_RPC_TIMEOUT_MS", default_value_t = 200)]
    pub rpc_timeout_ms: u64,

    /// Capacity of the apply channel
    #[arg(long, env = "RAFT_APPLY_BUFFER", default_value_t = 256)]
    pub apply_buffer: usize,
}

impl ConfigArgs {
    pub fn into_config(self) -> Result<RaftConfig> {
        let config = RaftConfig::default()
            .with_election_timeout(
                Duration::from_millis(self.election_timeout_min_ms),
                Duration::from_millis(self.election_timeout_max_ms),
            )
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .with_rpc_timeout(Duration::from_millis(self.rpc_timeout_ms))
            .with_apply_buffer(self.apply_buffer);
        config.validate()?;
        Ok(config)
    }
}
