//! Simulation configuration.
//!
//! Loaded from JSON; every field is optional and falls back to the
//! constants in `core::params`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::params::*;
use crate::miner::MinerConfig;
use crate::node::NodeConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which signature check nodes run on transaction inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    Format,
    Ed25519,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub nodes: usize,
    /// How many of the nodes mine; `None` means all
    pub miners: Option<usize>,
    pub seed: u64,
    /// Simulated milliseconds per tick
    pub tick_ms: u64,
    /// Hashes per simulated second per miner; `None` hashes a fixed batch per tick
    pub hash_rate: Option<f64>,
    pub hash_batch: u64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub peer_ttl_ms: u64,
    pub dedup_ttl_ms: u64,
    /// How often nodes with free slots look for new peers
    pub rediscovery_interval_ms: u64,
    pub misbehavior_penalty: u32,
    pub misbehavior_threshold: u32,
    pub sync_retry_factor: usize,
    /// Mean gap between random wallet payments; 0 disables them
    pub tx_interval_ms: u64,
    pub verifier: VerifierKind,
    pub consensus: ConsensusParams,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 6,
            miners: None,
            seed: 42,
            tick_ms: 100,
            hash_rate: None,
            hash_batch: DEFAULT_HASH_BATCH,
            min_latency_ms: 20,
            max_latency_ms: 250,
            peer_ttl_ms: PEER_TTL_MS,
            dedup_ttl_ms: DEDUP_TTL_MS,
            rediscovery_interval_ms: 5_000,
            misbehavior_penalty: MISBEHAVIOR_PENALTY,
            misbehavior_threshold: MISBEHAVIOR_THRESHOLD,
            sync_retry_factor: SYNC_RETRY_FACTOR,
            tx_interval_ms: 2_000,
            verifier: VerifierKind::Format,
            consensus: ConsensusParams::default(),
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: SimConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::info!("⚙️  Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("config serialization failed")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.nodes == 0 {
            return invalid("nodes must be at least 1");
        }
        if self.tick_ms == 0 {
            return invalid("tick_ms must be positive");
        }
        if self.min_latency_ms > self.max_latency_ms {
            return invalid("min_latency_ms exceeds max_latency_ms");
        }
        if self.misbehavior_penalty == 0 || self.misbehavior_threshold == 0 {
            return invalid("misbehavior penalty and threshold must be positive");
        }
        if self.consensus.difficulty_adjustment_interval == 0 || self.consensus.target_block_time == 0 {
            return invalid("consensus intervals must be positive");
        }
        if matches!(self.hash_rate, Some(r) if !(r > 0.0)) {
            return invalid("hash_rate must be positive");
        }
        Ok(())
    }

    pub fn miner_count(&self) -> usize {
        self.miners.unwrap_or(self.nodes).min(self.nodes)
    }

    /// Per-node settings for a node with `peer_capacity` slots
    pub fn node_config(&self, peer_capacity: usize) -> NodeConfig {
        NodeConfig {
            miner: MinerConfig { hash_rate: self.hash_rate, batch_size: self.hash_batch },
            peer_capacity,
            dedup_ttl_ms: self.dedup_ttl_ms,
            peer_ttl_ms: self.peer_ttl_ms,
            misbehavior_penalty: self.misbehavior_penalty,
            misbehavior_threshold: self.misbehavior_threshold,
            sync_retry_factor: self.sync_retry_factor,
            event_capacity: EVENT_LOG_CAPACITY,
        }
    }
}
