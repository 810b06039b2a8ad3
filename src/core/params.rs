/// ForkSim network parameters.
/// Genesis consensus defaults and the gossip/peer tuning constants live here.
use serde::{Deserialize, Serialize};

/// Base unit denomination (like satoshis for Bitcoin)
pub const COIN: u64 = 100_000_000;

/// Initial block subsidy: 50 coins
pub const INITIAL_BLOCK_REWARD: u64 = 50 * COIN;

/// Halving interval in blocks. Short enough that a long simulation sees one.
pub const HALVING_INTERVAL: u64 = 210;

/// Retarget every this many blocks, counted from the epoch start
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 20;

/// Target block time in seconds
pub const TARGET_BLOCK_TIME: u64 = 10;

/// Maximum serialized block size in bytes
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum transactions per block (coinbase included)
pub const MAX_TXS_PER_BLOCK: usize = 2_000;

/// Easiest target allowed (~1 in 2 hashes succeed)
pub const POW_LIMIT_BITS: u32 = 0x207f_ffff;

/// Genesis difficulty: roughly 512 hashes per block
pub const INITIAL_BITS: u32 = 0x1f7f_ffff;

/// Number of ancestors in the median-time-past window
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Blocks may not be stamped further than this ahead of the local clock (ms)
pub const MAX_FUTURE_DRIFT_MS: u64 = 2 * 60 * 60 * 1000;

/// Misbehavior points charged per rejected block
pub const MISBEHAVIOR_PENALTY: u32 = 50;

/// A peer at or above this score is disconnected
pub const MISBEHAVIOR_THRESHOLD: u32 = 250;

/// How long a (hash, peer) delivery is remembered for dedup (ms)
pub const DEDUP_TTL_MS: u64 = 2 * 60 * 1000;

/// Connection lifetime before a peer link expires (ms)
pub const PEER_TTL_MS: u64 = 10 * 60 * 1000;

/// Peer slot capacity is drawn uniformly from this range at node creation
pub const MIN_PEER_SLOTS: usize = 2;
pub const MAX_PEER_SLOTS: usize = 3;

/// Orphan blocks buffered per node while waiting for a parent
pub const MAX_ORPHAN_BLOCKS: usize = 500;
/// Buffered orphans are dropped after this long (ms)
pub const ORPHAN_TTL_MS: u64 = 2 * 60 * 1000;

/// Catch-up gives up after this many consecutive misses per peer
pub const SYNC_RETRY_FACTOR: usize = 5;

/// Hashes per tick when the miner is not rate-limited
pub const DEFAULT_HASH_BATCH: u64 = 1_000;

/// Bounded size of each node's in-memory event log
pub const EVENT_LOG_CAPACITY: usize = 500;

/// Render base units as whole coins, trimming trailing zeros
pub fn format_amount(base_units: u64) -> String {
    let whole = base_units / COIN;
    let frac = base_units % COIN;
    if frac == 0 { format!("{}", whole) }
    else { format!("{}.{:08}", whole, frac).trim_end_matches('0').to_string() }
}

/// Consensus parameters carried by one epoch of a consensus version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub max_block_size: usize,
    pub max_transactions: usize,
    pub difficulty_adjustment_interval: u64,
    pub halving_interval: u64,
    /// Seconds
    pub target_block_time: u64,
    pub initial_subsidy: u64,
    pub initial_bits: u32,
    pub pow_limit_bits: u32,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            max_block_size: MAX_BLOCK_SIZE,
            max_transactions: MAX_TXS_PER_BLOCK,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            halving_interval: HALVING_INTERVAL,
            target_block_time: TARGET_BLOCK_TIME,
            initial_subsidy: INITIAL_BLOCK_REWARD,
            initial_bits: INITIAL_BITS,
            pow_limit_bits: POW_LIMIT_BITS,
        }
    }
}

impl ConsensusParams {
    /// Parameters where every hash has ~50% chance and retargeting never
    /// kicks in during short runs. Used by tests.
    pub fn regtest() -> Self {
        Self {
            initial_bits: POW_LIMIT_BITS,
            difficulty_adjustment_interval: 10_000,
            ..Self::default()
        }
    }

    /// Expected wall time of one retarget window in milliseconds
    pub fn expected_timespan_ms(&self) -> u64 {
        self.difficulty_adjustment_interval
            .saturating_mul(self.target_block_time)
            .saturating_mul(1000)
    }

    /// Calculate block subsidy at a given height
    pub fn subsidy(&self, height: i64) -> u64 {
        if height < 0 || self.halving_interval == 0 {
            return self.initial_subsidy;
        }
        let halvings = height as u64 / self.halving_interval;
        if halvings >= 64 {
            return 0;
        }
        self.initial_subsidy >> halvings
    }

    pub fn is_halving_height(&self, height: i64) -> bool {
        height > 0 && self.halving_interval > 0 && height as u64 % self.halving_interval == 0
    }
}
