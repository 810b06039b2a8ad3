use serde::{Deserialize, Serialize};

use crate::core::chain::ChainTree;
use crate::core::consensus::{ConsensusError, ConsensusVersion};
use crate::core::difficulty::{estimated_hashes, hash_meets_bits};
use crate::core::params::DEFAULT_HASH_BATCH;
use crate::core::types::*;

/// Mining configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Hashes per simulated second; `None` hashes `batch_size` nonces per tick
    pub hash_rate: Option<f64>,
    pub batch_size: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self { hash_rate: None, batch_size: DEFAULT_HASH_BATCH }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiningStatus {
    Idle,
    Mining,
}

/// Create a block template on top of the current tip.
///
/// The coinbase carries the subsidy only; fees are credited by the ledger
/// when the block is accepted. Transactions are taken in mempool order until
/// the size or count limit would be exceeded.
pub fn create_block_template(
    chain: &ChainTree,
    consensus: &ConsensusVersion,
    pending_txs: &[Transaction],
    miner_id: NodeId,
    miner_address: &str,
    now: u64,
) -> Result<Block, ConsensusError> {
    let parent = chain.tip_id();
    let prev = chain.block(parent);
    let height = prev.height + 1;
    let params = consensus.params_at(height)?;
    let bits = chain.next_bits(parent, consensus)?;
    let timestamp = now.max(chain.mtp(parent) + 1);

    let coinbase = Transaction::new_coinbase(height, miner_address, params.subsidy(height), timestamp);

    let mut block = Block {
        height,
        previous_hash: prev.hash,
        hash: NULL_HASH,
        nonce: 0,
        bits,
        transactions: vec![coinbase],
        miner: miner_id,
        consensus_version: consensus.version,
        timestamp,
    };

    let mut block_size = block.size();
    for tx in pending_txs {
        if tx.is_coinbase() { continue; }
        let tx_size = tx.size();
        if block_size + tx_size > params.max_block_size { break; }
        if block.transactions.len() + 1 > params.max_transactions { break; }
        block.transactions.push(tx.clone());
        block_size += tx_size;
    }

    Ok(block)
}

/// In-progress work on one template
#[derive(Debug, Clone)]
pub struct MiningSession {
    pub template: Block,
    merkle_root: Hash256,
    pub hashes: u64,
    pub started_at: u64,
}

impl MiningSession {
    fn new(template: Block, now: u64) -> Self {
        let merkle_root = template.compute_merkle_root();
        Self { template, merkle_root, hashes: 0, started_at: now }
    }
}

/// Incremental miner driven by simulation ticks.
///
/// Each tick converts elapsed simulated time into a hash budget and tries
/// that many nonces on the current template. Elapsed time accumulates only
/// while mining; stopping freezes it.
#[derive(Debug)]
pub struct MiningEngine {
    config: MinerConfig,
    status: MiningStatus,
    session: Option<MiningSession>,
    last_tick: Option<u64>,
    elapsed_ms: u64,
    /// Fractional time not yet converted into hashes (rate-limited mode)
    carry_ms: f64,
    total_hashes: u64,
}

impl MiningEngine {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            status: MiningStatus::Idle,
            session: None,
            last_tick: None,
            elapsed_ms: 0,
            carry_ms: 0.0,
            total_hashes: 0,
        }
    }

    pub fn config(&self) -> &MinerConfig { &self.config }
    pub fn status(&self) -> MiningStatus { self.status }
    pub fn is_mining(&self) -> bool { self.status == MiningStatus::Mining }
    pub fn elapsed_ms(&self) -> u64 { self.elapsed_ms }
    pub fn total_hashes(&self) -> u64 { self.total_hashes }
    pub fn session(&self) -> Option<&MiningSession> { self.session.as_ref() }
    pub fn template(&self) -> Option<&Block> { self.session.as_ref().map(|s| &s.template) }

    /// Hashes per simulated second over the whole mining time
    pub fn effective_hash_rate(&self) -> f64 {
        if self.elapsed_ms == 0 { 0.0 } else { self.total_hashes as f64 * 1000.0 / self.elapsed_ms as f64 }
    }

    pub fn start(&mut self) {
        if self.status == MiningStatus::Idle {
            self.status = MiningStatus::Mining;
            self.last_tick = None;
        }
    }

    pub fn stop(&mut self) {
        self.status = MiningStatus::Idle;
        self.last_tick = None;
    }

    pub fn install_template(&mut self, template: Block, now: u64) {
        tracing::debug!(
            "⛏️  Template #{} on {} (bits {:08x}, ~{:.0} expected hashes, {} txs)",
            template.height,
            short_hex(&template.previous_hash),
            template.bits,
            estimated_hashes(template.bits),
            template.transactions.len(),
        );
        self.session = Some(MiningSession::new(template, now));
    }

    pub fn discard_template(&mut self) {
        self.session = None;
    }

    /// Whether the template still builds on `tip_hash`
    pub fn template_builds_on(&self, tip_hash: &Hash256) -> bool {
        self.template().map_or(false, |t| &t.previous_hash == tip_hash)
    }

    /// Append a transaction to the live template if limits allow
    pub fn push_transaction(&mut self, tx: Transaction, max_block_size: usize, max_transactions: usize) -> bool {
        let Some(session) = self.session.as_mut() else { return false };
        if session.template.transactions.len() + 1 > max_transactions
            || session.template.size() + tx.size() > max_block_size
        {
            return false;
        }
        session.template.transactions.push(tx);
        session.merkle_root = session.template.compute_merkle_root();
        true
    }

    /// Convert time since the previous tick into a hash budget
    fn budget(&mut self, now: u64, batch: u64) -> u64 {
        let delta = self.last_tick.map_or(0, |prev| now.saturating_sub(prev));
        self.last_tick = Some(now);
        self.elapsed_ms += delta;
        match self.config.hash_rate {
            None => batch,
            Some(rate) if rate > 0.0 => {
                self.carry_ms += delta as f64;
                let per_hash = 1000.0 / rate;
                let n = (self.carry_ms / per_hash).floor();
                self.carry_ms -= n * per_hash;
                n as u64
            }
            Some(_) => 0,
        }
    }

    /// Run one tick. Returns a sealed block when a nonce meets the target;
    /// the session is consumed in that case.
    pub fn tick(&mut self, now: u64, batch: Option<u64>) -> Option<Block> {
        if !self.is_mining() {
            return None;
        }
        let batch = batch.unwrap_or(self.config.batch_size);
        let budget = self.budget(now, batch);
        let session = self.session.as_mut()?;

        for _ in 0..budget {
            let hash = session.template.header_hash(&session.merkle_root);
            session.hashes += 1;
            self.total_hashes += 1;
            if hash_meets_bits(&hash, session.template.bits) {
                session.template.hash = hash;
                let elapsed = now.saturating_sub(session.started_at);
                tracing::debug!(
                    "⛏️  Block #{} solved: nonce={} hashes={} time={}ms",
                    session.template.height,
                    session.template.nonce,
                    session.hashes,
                    elapsed,
                );
                return self.session.take().map(|s| s.template);
            }
            session.template.nonce = session.template.nonce.wrapping_add(1);
        }
        None
    }
}
