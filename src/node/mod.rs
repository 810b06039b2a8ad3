//! A simulated full node.
//!
//! `Node` owns its chain tree, ledger, mempool and miner exclusively. It
//! never reaches into another node: anything meant for a peer is queued as
//! a `NodeAction` and delivered by the simulation after the link latency.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::core::chain::{BlockId, ChainError, ChainSnapshot, ChainTree, Reorg};
use crate::core::consensus::{are_compatible, divergence_height, ConsensusError, ConsensusVersion, ForkKind};
use crate::core::difficulty::estimated_hashes;
use crate::core::ledger::{Ledger, LedgerError, LedgerSnapshot, LedgerState, TxRejectReason};
use crate::core::params::*;
use crate::core::types::*;
use crate::crypto::SignatureVerifier;
use crate::miner::{create_block_template, MinerConfig, MiningEngine};
use crate::network::{
    BlockSource, GossipMessage, Mempool, Neighbor, NodeAction, OrphanPool, PeerCandidate, PeerScoreboard, PeerTable,
    SeenHistory,
};

pub mod events;

pub use events::{EventLog, NodeEvent, TimedEvent};

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("parent block not known")]
    OrphanBlock,
    #[error("block already known")]
    DuplicateBlock,
    #[error("block hash does not match its header")]
    InvalidHash,
    #[error("block hash does not meet its target")]
    InvalidTarget,
    #[error("timestamp {0} outside the allowed window")]
    InvalidTimestamp(u64),
    #[error("difficulty bits {found:08x}, expected {expected:08x}")]
    InvalidDifficultyBits { expected: u32, found: u32 },
    #[error("block size {0} exceeds the limit")]
    InvalidBlockSize(usize),
    #[error("block carries {0} transactions")]
    InvalidTransactionCount(usize),
    #[error("transaction {} rejected: {reason}", short_hex(.tx_id))]
    TransactionRejected { reason: TxRejectReason, tx_id: Hash256 },
    #[error("could not fetch the missing chain from peers")]
    ChainSyncFailed,
    #[error("block built under incompatible consensus version {0}")]
    ConsensusIncompatible(u32),
    #[error("peer {peer} reached misbehavior score {score}")]
    Misbehavior { peer: NodeId, score: u32 },
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// ─── Config & Outcomes ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub miner: MinerConfig,
    pub peer_capacity: usize,
    pub dedup_ttl_ms: u64,
    pub peer_ttl_ms: u64,
    pub misbehavior_penalty: u32,
    pub misbehavior_threshold: u32,
    pub sync_retry_factor: usize,
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            miner: MinerConfig::default(),
            peer_capacity: MAX_PEER_SLOTS,
            dedup_ttl_ms: DEDUP_TTL_MS,
            peer_ttl_ms: PEER_TTL_MS,
            misbehavior_penalty: MISBEHAVIOR_PENALTY,
            misbehavior_threshold: MISBEHAVIOR_THRESHOLD,
            sync_retry_factor: SYNC_RETRY_FACTOR,
            event_capacity: EVENT_LOG_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAccepted {
    pub hash: Hash256,
    pub height: i64,
    pub tip_changed: bool,
    /// Blocks reverted from the previous selected chain
    pub reorg_depth: usize,
}

/// What a node did with a block delivered by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Accepted(BlockAccepted),
    /// Already stored; relayed because this peer had not sent it before
    Known,
    /// Buffered until `missing` is known
    Orphaned { missing: Hash256 },
    /// Dropped before validation
    Ignored,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub consensus_version: u32,
    pub mining_address: Address,
    pub mining: bool,
    pub config: NodeConfig,
    pub chain: ChainSnapshot,
    pub ledger: LedgerSnapshot,
    pub mempool: Vec<Transaction>,
    pub block_log: Vec<(Hash256, Vec<String>)>,
}

// ─── Block Rules ────────────────────────────────────────────────────

/// Consensus checks on a block whose parent is `parent` in `chain`.
/// `now` enables the future-drift check; re-validation passes `None`.
pub fn check_block_rules(
    chain: &ChainTree,
    consensus: &ConsensusVersion,
    block: &Block,
    parent: BlockId,
    now: Option<u64>,
) -> Result<(), RejectReason> {
    let height = block.height.max(0) as u64;
    match consensus.find_in_history(block.consensus_version) {
        Some(version) if are_compatible(version, consensus, height) == ForkKind::Hard => {
            return Err(RejectReason::ConsensusIncompatible(block.consensus_version));
        }
        Some(_) => {}
        // Newer rules we have not seen: judge the block by ours below
        None if block.consensus_version > consensus.version => {}
        None => return Err(RejectReason::ConsensusIncompatible(block.consensus_version)),
    }

    let params = consensus.params_at(block.height)?;
    let size = block.size();
    if size > params.max_block_size {
        return Err(RejectReason::InvalidBlockSize(size));
    }
    let count = block.transactions.len();
    if count == 0 || count > params.max_transactions {
        return Err(RejectReason::InvalidTransactionCount(count));
    }

    let expected = chain.next_bits(parent, consensus)?;
    if block.bits != expected {
        return Err(RejectReason::InvalidDifficultyBits { expected, found: block.bits });
    }

    if block.timestamp <= chain.mtp(parent) {
        return Err(RejectReason::InvalidTimestamp(block.timestamp));
    }
    if let Some(now) = now {
        if block.timestamp > now.saturating_add(MAX_FUTURE_DRIFT_MS) {
            return Err(RejectReason::InvalidTimestamp(block.timestamp));
        }
    }
    Ok(())
}

/// Pair each block with the subsidy it earns under `consensus`
fn with_subsidy<'a>(
    chain: &'a ChainTree,
    consensus: &ConsensusVersion,
    ids: &[BlockId],
) -> Result<Vec<(&'a Block, u64)>, ConsensusError> {
    ids.iter()
        .map(|&id| {
            let block = chain.block(id);
            Ok((block, consensus.params_at(block.height)?.subsidy(block.height)))
        })
        .collect()
}

/// A served block really is `want`, one height below the block that asked for it
fn links_to(block: &Block, want: &Hash256, expected: Option<i64>) -> bool {
    block.hash == *want
        && block.height > ORIGIN_HEIGHT
        && expected.map_or(true, |h| block.height == h)
        && block.compute_hash() == *want
}

fn harder(a: ForkKind, b: ForkKind) -> ForkKind {
    match (a, b) {
        (ForkKind::Hard, _) | (_, ForkKind::Hard) => ForkKind::Hard,
        (ForkKind::Soft, _) | (_, ForkKind::Soft) => ForkKind::Soft,
        _ => ForkKind::None,
    }
}

// ─── Node ───────────────────────────────────────────────────────────

pub struct Node {
    id: NodeId,
    consensus: Arc<ConsensusVersion>,
    chain: ChainTree,
    ledger: Ledger,
    mempool: Mempool,
    miner: MiningEngine,
    mining_address: Address,
    peers: PeerTable,
    scores: PeerScoreboard,
    seen_blocks: SeenHistory,
    seen_txs: SeenHistory,
    orphans: OrphanPool,
    outbox: Vec<NodeAction>,
    block_log: HashMap<Hash256, Vec<String>>,
    events: EventLog,
    config: NodeConfig,
    now: u64,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("consensus", &self.consensus.version)
            .field("chain", &self.chain)
            .field("peers", &self.peers.ids())
            .field("mempool", &self.mempool.len())
            .finish()
    }
}

impl Node {
    pub fn new(
        id: NodeId,
        consensus: Arc<ConsensusVersion>,
        mining_address: Address,
        verifier: Arc<dyn SignatureVerifier>,
        config: NodeConfig,
    ) -> Self {
        Self {
            id,
            consensus,
            chain: ChainTree::new(),
            ledger: Ledger::new(verifier),
            mempool: Mempool::new(),
            miner: MiningEngine::new(config.miner.clone()),
            mining_address,
            peers: PeerTable::new(config.peer_capacity),
            scores: PeerScoreboard::new(config.misbehavior_penalty, config.misbehavior_threshold),
            seen_blocks: SeenHistory::new(config.dedup_ttl_ms),
            seen_txs: SeenHistory::new(config.dedup_ttl_ms),
            orphans: OrphanPool::default(),
            outbox: Vec::new(),
            block_log: HashMap::new(),
            events: EventLog::new(config.event_capacity),
            config,
            now: 0,
        }
    }

    pub fn id(&self) -> NodeId { self.id }
    pub fn consensus(&self) -> &Arc<ConsensusVersion> { &self.consensus }
    pub fn chain(&self) -> &ChainTree { &self.chain }
    pub fn ledger(&self) -> &Ledger { &self.ledger }
    pub fn balances(&self) -> Arc<LedgerState> { self.ledger.snapshot() }
    pub fn balance(&self, address: &str) -> u64 { self.ledger.balance(address) }
    pub fn mempool(&self) -> &Mempool { &self.mempool }
    pub fn miner(&self) -> &MiningEngine { &self.miner }
    pub fn is_mining(&self) -> bool { self.miner.is_mining() }
    pub fn mining_address(&self) -> &str { &self.mining_address }
    pub fn peers(&self) -> &PeerTable { &self.peers }
    pub fn peer_count(&self) -> usize { self.peers.len() }
    pub fn peer_score(&self, peer: NodeId) -> u32 { self.scores.score(peer) }
    pub fn orphans(&self) -> &OrphanPool { &self.orphans }
    pub fn events(&self) -> &EventLog { &self.events }
    pub fn config(&self) -> &NodeConfig { &self.config }
    pub fn height(&self) -> i64 { self.chain.height() }
    pub fn tip_hash(&self) -> Hash256 { self.chain.block(self.chain.tip_id()).hash }
    pub fn block_log(&self, hash: &Hash256) -> &[String] { self.block_log.get(hash).map_or(&[][..], |v| v.as_slice()) }

    pub fn subscribe_balances(&self) -> watch::Receiver<Arc<LedgerState>> { self.ledger.subscribe() }
    pub fn subscribe_events(&self) -> broadcast::Receiver<TimedEvent> { self.events.subscribe() }

    /// Actions queued since the last drain
    pub fn drain_actions(&mut self) -> Vec<NodeAction> { std::mem::take(&mut self.outbox) }

    /// Serve a stored block to a peer
    pub fn serve_block(&self, hash: &Hash256) -> Option<Block> {
        if *hash == NULL_HASH { return None; }
        self.chain.block_by_hash(hash).cloned()
    }

    fn emit(&mut self, event: NodeEvent) {
        self.events.push(self.now, event);
    }

    fn latency_to_miner(&self, miner: NodeId) -> u64 {
        if miner == self.id { 0 } else { self.peers.latency_to(miner).unwrap_or(u64::MAX) }
    }

    // ─── Blocks ──────────────────────────────────────────────────────

    /// Validate a block and attach it to the tree. When the selected chain
    /// moves, the ledger follows it.
    pub fn add_block(&mut self, block: Block, now: u64) -> Result<BlockAccepted, RejectReason> {
        self.now = self.now.max(now);
        if block.hash != block.compute_hash() {
            return Err(RejectReason::InvalidHash);
        }
        if !block.meets_target() {
            return Err(RejectReason::InvalidTarget);
        }
        let parent = self.chain.find(block.height - 1, &block.previous_hash).ok_or(RejectReason::OrphanBlock)?;
        if self.chain.contains_hash(&block.hash) {
            return Err(RejectReason::DuplicateBlock);
        }
        check_block_rules(&self.chain, &self.consensus, &block, parent, Some(now))?;

        // Transactions are checked against the branch the block extends
        let subsidy = self.consensus.params_at(block.height)?.subsidy(block.height);
        let branch = self.chain.diff_to(parent);
        let reverted: Vec<&Block> = branch.reverted.iter().map(|&id| self.chain.block(id)).collect();
        let applied = with_subsidy(&self.chain, &self.consensus, &branch.applied)?;
        let view = self.ledger.view_after(&reverted, &applied)?;
        self.ledger
            .check_block(&view, &block, subsidy)
            .map_err(|r| RejectReason::TransactionRejected { reason: r.reason, tx_id: r.tx_id })?;

        let latency = self.latency_to_miner(block.miner);
        let (hash, height, miner, bits) = (block.hash, block.height, block.miner, block.bits);
        let attached = self.chain.add_block(block, latency).map_err(|e| match e {
            ChainError::OrphanBlock => RejectReason::OrphanBlock,
            _ => RejectReason::DuplicateBlock,
        })?;

        if attached.tip_changed {
            self.follow_reorg(&attached.reorg);
        }
        self.record_milestones(hash, height, bits);

        tracing::debug!(
            "📦 Node {} accepted block #{} ({}) from miner {}",
            self.id,
            height,
            short_hex(&hash),
            miner
        );
        self.emit(NodeEvent::BlockAccepted { hash, height, miner, tip_changed: attached.tip_changed });
        if attached.reorg.depth() > 0 {
            tracing::info!(
                "🔀 Node {} reorg: {} reverted, {} applied, tip #{} ({})",
                self.id,
                attached.reorg.reverted.len(),
                attached.reorg.applied.len(),
                self.height(),
                short_hex(&self.tip_hash())
            );
            self.emit(NodeEvent::Reorg { depth: attached.reorg.depth(), new_tip: self.tip_hash() });
        }

        Ok(BlockAccepted {
            hash,
            height,
            tip_changed: attached.tip_changed,
            reorg_depth: attached.reorg.depth(),
        })
    }

    /// Move the ledger to the new selected chain and re-check the mempool
    fn follow_reorg(&mut self, reorg: &Reorg) {
        let returned: Vec<Transaction> = reorg
            .reverted
            .iter()
            .rev()
            .flat_map(|&id| self.chain.block(id).transactions.iter().skip(1).cloned())
            .collect();

        let reverted: Vec<&Block> = reorg.reverted.iter().map(|&id| self.chain.block(id)).collect();
        let synced = match with_subsidy(&self.chain, &self.consensus, &reorg.applied) {
            Ok(applied) => self.ledger.reorganize(&reverted, &applied).map_err(RejectReason::from),
            Err(e) => Err(RejectReason::from(e)),
        };
        if let Err(e) = synced {
            tracing::error!("💥 Node {} incremental reorg failed ({}), rebuilding ledger", self.id, e);
            if let Err(e) = self.rebuild_ledger() {
                tracing::error!("💥 Node {} ledger rebuild stopped early: {}", self.id, e);
            }
        }

        let tip = self.tip_hash();
        if !self.miner.template_builds_on(&tip) {
            self.miner.discard_template();
        }
        self.refresh_mempool(returned);
    }

    /// Replay the whole selected chain into a fresh ledger
    fn rebuild_ledger(&mut self) -> Result<(), RejectReason> {
        let ids = self.chain.selected_chain();
        let chain = with_subsidy(&self.chain, &self.consensus, &ids)?;
        self.ledger.rebuild(&chain)?;
        Ok(())
    }

    /// Re-validate pending transactions against the current tip. `returned`
    /// holds transactions of reverted blocks, lowest block first.
    fn refresh_mempool(&mut self, returned: Vec<Transaction>) {
        let mut pending = returned;
        pending.extend(self.mempool.drain());
        self.ledger.clear_virtual();
        for tx in pending {
            if tx.is_coinbase() || self.ledger.is_confirmed(&tx.id) || self.mempool.contains(&tx.id) {
                continue;
            }
            match self.ledger.validate_pending(&tx) {
                Ok(fee) => {
                    self.ledger.add_virtual(&tx);
                    self.mempool.add_with_fee(tx, fee);
                }
                Err(reason) => {
                    tracing::debug!("🗑️ Node {} dropped pending tx {}: {}", self.id, short_hex(&tx.id), reason);
                }
            }
        }
    }

    fn record_milestones(&mut self, hash: Hash256, height: i64, bits: u32) {
        let mut notes = Vec::new();
        if ChainTree::is_retarget_height(height, &self.consensus) {
            notes.push(format!("difficulty retarget: bits {:08x} (~{:.0} hashes per block)", bits, estimated_hashes(bits)));
        }
        if let Ok(params) = self.consensus.params_at(height) {
            if params.is_halving_height(height) {
                notes.push(format!("halving: subsidy now {}", format_amount(params.subsidy(height))));
            }
        }
        for note in &notes {
            tracing::info!("📉 Node {} block #{}: {}", self.id, height, note);
            self.emit(NodeEvent::Milestone { hash, height, note: note.clone() });
        }
        if !notes.is_empty() {
            self.block_log.insert(hash, notes);
        }
    }

    // ─── Transactions ────────────────────────────────────────────────

    /// Validate against the tip plus pending transactions, then pool it
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), RejectReason> {
        let reject = |reason| RejectReason::TransactionRejected { reason, tx_id: tx.id };
        if tx.is_coinbase() {
            return Err(reject(TxRejectReason::MalformedTx));
        }
        if self.mempool.contains(&tx.id) {
            return Err(reject(TxRejectReason::DuplicateTransaction));
        }
        let fee = self.ledger.validate_pending(&tx).map_err(reject)?;
        self.ledger.add_virtual(&tx);

        if self.miner.template().is_some() {
            let params = self.consensus.params_at(self.height() + 1)?;
            let (max_size, max_txs) = (params.max_block_size, params.max_transactions);
            self.miner.push_transaction(tx.clone(), max_size, max_txs);
        }
        let tx_id = tx.id;
        self.mempool.add_with_fee(tx, fee);
        tracing::debug!("📝 Node {} pooled tx {} (fee {})", self.id, short_hex(&tx_id), fee);
        self.emit(NodeEvent::TransactionAccepted { tx_id });
        Ok(())
    }

    /// Pool a locally created transaction and gossip it to every peer
    pub fn submit_transaction(&mut self, tx: Transaction, now: u64) -> Result<(), RejectReason> {
        self.now = self.now.max(now);
        self.add_transaction(tx.clone())?;
        self.seen_txs.record(tx.id, self.id, now);
        self.broadcast(GossipMessage::Transaction(tx), None);
        Ok(())
    }

    /// Handle a transaction relayed by a peer. Returns true if it was pooled
    /// and relayed.
    pub fn receive_transaction(&mut self, from: NodeId, tx: Transaction, now: u64) -> Result<bool, RejectReason> {
        self.now = self.now.max(now);
        if !self.peers.contains(from) || !self.seen_txs.record(tx.id, from, now) {
            return Ok(false);
        }
        if self.mempool.contains(&tx.id) || self.ledger.is_confirmed(&tx.id) {
            return Ok(false);
        }
        self.add_transaction(tx.clone())?;
        self.broadcast(GossipMessage::Transaction(tx), Some(from));
        Ok(true)
    }

    // ─── Gossip ──────────────────────────────────────────────────────

    fn broadcast(&mut self, message: GossipMessage, except: Option<NodeId>) {
        for neighbor in self.peers.iter() {
            if Some(neighbor.node) == except {
                continue;
            }
            self.outbox.push(NodeAction::Send {
                to: neighbor.node,
                latency_ms: neighbor.latency_ms,
                message: message.clone(),
            });
        }
    }

    /// Handle a block relayed by a peer
    pub fn receive_block(&mut self, from: NodeId, block: Block, now: u64) -> ReceiveOutcome {
        self.now = self.now.max(now);
        if !self.peers.contains(from) {
            tracing::debug!("Node {} ignored block from non-peer {}", self.id, from);
            return ReceiveOutcome::Ignored;
        }
        if !self.seen_blocks.record(block.hash, from, now) {
            tracing::debug!("🔁 Node {} dropped repeat of {} from {}", self.id, short_hex(&block.hash), from);
            return ReceiveOutcome::Ignored;
        }

        match self.add_block(block.clone(), now) {
            Ok(accepted) => {
                let hash = block.hash;
                self.broadcast(GossipMessage::Block(block), Some(from));
                self.drain_orphans(hash, now);
                ReceiveOutcome::Accepted(accepted)
            }
            Err(RejectReason::DuplicateBlock) => {
                self.broadcast(GossipMessage::Block(block), Some(from));
                ReceiveOutcome::Known
            }
            Err(RejectReason::OrphanBlock) => {
                let missing = block.previous_hash;
                tracing::debug!(
                    "📥 Node {} buffered orphan #{} from {} (missing {})",
                    self.id,
                    block.height,
                    from,
                    short_hex(&missing)
                );
                self.orphans.insert(block, from, now);
                ReceiveOutcome::Orphaned { missing }
            }
            Err(reason) => {
                tracing::warn!("❌ Node {} rejected block #{} from {}: {}", self.id, block.height, from, reason);
                self.emit(NodeEvent::BlockRejected { hash: block.hash, from: Some(from), reason: reason.to_string() });
                self.penalize(from, reason)
            }
        }
    }

    fn penalize(&mut self, peer: NodeId, reason: RejectReason) -> ReceiveOutcome {
        if !self.scores.record_offense(peer) {
            return ReceiveOutcome::Rejected(reason);
        }
        let score = self.scores.score(peer);
        tracing::warn!("🚫 Node {} disconnecting peer {} (misbehavior score {})", self.id, peer, score);
        self.disconnect(peer);
        self.outbox.push(NodeAction::Disconnect { peer });
        ReceiveOutcome::Rejected(RejectReason::Misbehavior { peer, score })
    }

    /// Attach buffered blocks that were waiting on `parent`, recursively
    fn drain_orphans(&mut self, parent: Hash256, now: u64) -> usize {
        let mut queue = vec![parent];
        let mut attached = 0;
        while let Some(hash) = queue.pop() {
            for (block, from) in self.orphans.take_children(&hash) {
                let child = block.hash;
                match self.add_block(block.clone(), now) {
                    Ok(_) => {
                        attached += 1;
                        self.broadcast(GossipMessage::Block(block), Some(from));
                        queue.push(child);
                    }
                    Err(RejectReason::DuplicateBlock) => queue.push(child),
                    Err(reason) => {
                        tracing::warn!("❌ Node {} dropped orphan #{} from {}: {}", self.id, block.height, from, reason);
                        self.emit(NodeEvent::BlockRejected { hash: child, from: Some(from), reason: reason.to_string() });
                        self.penalize(from, reason);
                    }
                }
            }
        }
        attached
    }

    /// Fetch the ancestors of `missing` until a known block, then attach
    /// them oldest first. Either the whole chain attaches or nothing does.
    pub fn catch_up_chain(&mut self, missing: Hash256, source: &dyn BlockSource, now: u64) -> Result<usize, RejectReason> {
        self.sync_chain(None, missing, source, now)
    }

    /// Catch up behind an orphan received from `from`, attaching the orphan
    /// itself last whether or not it is still buffered.
    pub fn catch_up_orphan(
        &mut self,
        orphan: Block,
        from: NodeId,
        source: &dyn BlockSource,
        now: u64,
    ) -> Result<usize, RejectReason> {
        let missing = orphan.previous_hash;
        self.sync_chain(Some((orphan, from)), missing, source, now)
    }

    fn sync_chain(
        &mut self,
        orphan: Option<(Block, NodeId)>,
        missing: Hash256,
        source: &dyn BlockSource,
        now: u64,
    ) -> Result<usize, RejectReason> {
        self.now = self.now.max(now);
        let peers = self.peers.ids();
        if peers.is_empty() {
            self.emit(NodeEvent::SyncFailed { missing });
            return Err(RejectReason::ChainSyncFailed);
        }
        let max_misses = self.config.sync_retry_factor.max(1) * peers.len();

        // highest first, with the peer that supplied each block
        let mut fetched: Vec<(Block, NodeId)> = Vec::new();
        let mut expected: Option<i64> = None;
        if let Some((block, from)) = orphan {
            self.orphans.remove(&block.hash);
            expected = Some(block.height - 1);
            fetched.push((block, from));
        }
        let mut want = missing;
        let mut misses = 0;
        let mut cursor = 0;
        while !self.chain.contains_hash(&want) {
            if expected.is_some_and(|h| h <= ORIGIN_HEIGHT) {
                tracing::warn!("📥 Node {} catch-up for {} walked past the origin", self.id, short_hex(&missing));
                self.emit(NodeEvent::SyncFailed { missing });
                return Err(RejectReason::ChainSyncFailed);
            }
            let buffered = self
                .orphans
                .get(&want)
                .filter(|(block, _)| links_to(block, &want, expected))
                .map(|(block, from)| (block.clone(), from));
            if let Some((block, from)) = buffered {
                want = block.previous_hash;
                expected = Some(block.height - 1);
                fetched.push((block, from));
                continue;
            }

            let peer = peers[cursor % peers.len()];
            cursor += 1;
            let served = if self.peers.contains(peer) { source.request_block(peer, &want) } else { None };
            match served {
                Some(block) if links_to(&block, &want, expected) => {
                    misses = 0;
                    want = block.previous_hash;
                    expected = Some(block.height - 1);
                    fetched.push((block, peer));
                }
                other => {
                    if let Some(block) = other {
                        if block.compute_hash() != block.hash {
                            self.penalize(peer, RejectReason::InvalidHash);
                        }
                    }
                    misses += 1;
                    if misses >= max_misses {
                        tracing::warn!(
                            "📥 Node {} catch-up for {} failed after {} misses",
                            self.id,
                            short_hex(&missing),
                            misses
                        );
                        self.emit(NodeEvent::SyncFailed { missing });
                        return Err(RejectReason::ChainSyncFailed);
                    }
                }
            }
        }
        let base = want;

        let chain_backup = self.chain.clone();
        let ledger_backup = self.ledger.checkpoint();
        let mut attached = 0;
        for (block, from) in fetched.iter().rev() {
            match self.add_block(block.clone(), now) {
                Ok(_) => attached += 1,
                Err(RejectReason::DuplicateBlock) => {}
                Err(reason) => {
                    tracing::warn!(
                        "📥 Node {} catch-up aborted at #{} from {}: {}; restoring tip #{}",
                        self.id,
                        block.height,
                        from,
                        reason,
                        chain_backup.height()
                    );
                    self.chain = chain_backup;
                    self.ledger.restore(ledger_backup);
                    self.miner.discard_template();
                    self.refresh_mempool(Vec::new());
                    self.emit(NodeEvent::BlockRejected { hash: block.hash, from: Some(*from), reason: reason.to_string() });
                    self.penalize(*from, reason);
                    self.emit(NodeEvent::SyncFailed { missing });
                    return Err(RejectReason::ChainSyncFailed);
                }
            }
        }

        for hash in std::iter::once(base).chain(fetched.iter().map(|(b, _)| b.hash)) {
            attached += self.drain_orphans(hash, now);
        }
        if attached > 0 {
            tracing::info!("📥 Node {} caught up {} blocks (height: {})", self.id, attached, self.height());
        }
        Ok(attached)
    }

    // ─── Mining ──────────────────────────────────────────────────────

    fn rebuild_template(&mut self, now: u64) {
        let pending = self.mempool.get_pending();
        match create_block_template(&self.chain, &self.consensus, &pending, self.id, &self.mining_address, now) {
            Ok(template) => self.miner.install_template(template, now),
            Err(e) => {
                tracing::error!("⛏️  Node {} cannot build a template: {}", self.id, e);
                self.miner.discard_template();
            }
        }
    }

    pub fn start_mining(&mut self, now: u64) {
        if self.miner.is_mining() {
            return;
        }
        self.now = self.now.max(now);
        if !self.miner.template_builds_on(&self.tip_hash()) {
            self.rebuild_template(now);
        }
        self.miner.start();
        tracing::info!("⛏️  Node {} mining on #{} to {}", self.id, self.height(), self.mining_address);
        self.emit(NodeEvent::MiningStarted);
    }

    pub fn stop_mining(&mut self) {
        if !self.miner.is_mining() {
            return;
        }
        self.miner.stop();
        tracing::info!("⛏️  Node {} stopped mining ({} hashes)", self.id, self.miner.total_hashes());
        self.emit(NodeEvent::MiningStopped);
    }

    /// Spend this tick's hash budget. A found block is added locally and
    /// broadcast only if accepted; either way mining moves to a fresh template.
    pub fn process_mining_tick(&mut self, now: u64, batch: Option<u64>) -> Option<Result<BlockAccepted, RejectReason>> {
        if !self.miner.is_mining() {
            return None;
        }
        self.now = self.now.max(now);
        if !self.miner.template_builds_on(&self.tip_hash()) {
            self.rebuild_template(now);
        }
        let block = self.miner.tick(now, batch)?;

        let result = self.add_block(block.clone(), now);
        match &result {
            Ok(accepted) => {
                tracing::info!(
                    "⛏️  Node {} mined block #{} ({}) with {} txs",
                    self.id,
                    accepted.height,
                    short_hex(&accepted.hash),
                    block.transactions.len()
                );
                self.seen_blocks.record(block.hash, self.id, now);
                self.broadcast(GossipMessage::Block(block), None);
            }
            Err(reason) => {
                tracing::warn!("⛏️  Node {} discarded its block #{}: {}", self.id, block.height, reason);
                self.emit(NodeEvent::BlockRejected { hash: block.hash, from: None, reason: reason.to_string() });
            }
        }
        self.rebuild_template(now);
        Some(result)
    }

    // ─── Peers ───────────────────────────────────────────────────────

    fn compatible_with(&self, other: &ConsensusVersion) -> bool {
        let height = self.height().max(0) as u64;
        are_compatible(&self.consensus, other, height) != ForkKind::Hard
    }

    /// Candidates worth dialing: compatible, not yet connected, at most as
    /// many as there are free slots, in random order.
    pub fn search_peers_to_connect<R: Rng + ?Sized>(&self, candidates: &[PeerCandidate], rng: &mut R) -> Vec<NodeId> {
        let mut found: Vec<NodeId> = Vec::new();
        for candidate in candidates {
            if candidate.id == self.id || self.peers.contains(candidate.id) {
                continue;
            }
            if !self.compatible_with(&candidate.consensus) {
                tracing::debug!(
                    "🚫 Node {} skipped incompatible node {} (v{} vs v{})",
                    self.id,
                    candidate.id,
                    self.consensus.version,
                    candidate.consensus.version
                );
                continue;
            }
            found.push(candidate.id);
        }
        found.shuffle(rng);
        found.truncate(self.peers.free_slots());
        found
    }

    /// Inbound request from `peer`. Evicts a neighbor when full; returns
    /// the evicted id.
    pub fn accept_connection<R, F>(
        &mut self,
        peer: NodeId,
        consensus: &ConsensusVersion,
        latency_ms: u64,
        now: u64,
        degree_of: F,
        rng: &mut R,
    ) -> Result<Option<NodeId>, RejectReason>
    where
        R: Rng + ?Sized,
        F: Fn(NodeId) -> usize,
    {
        self.now = self.now.max(now);
        if !self.compatible_with(consensus) {
            return Err(RejectReason::ConsensusIncompatible(consensus.version));
        }
        if peer == self.id || self.peers.contains(peer) {
            return Ok(None);
        }
        let mut evicted = None;
        if self.peers.is_full() {
            if let Some(victim) = self.peers.select_eviction(degree_of, rng) {
                tracing::info!("🔌 Node {} evicting peer {} for {}", self.id, victim, peer);
                self.disconnect(victim);
                self.outbox.push(NodeAction::Disconnect { peer: victim });
                evicted = Some(victim);
            }
        }
        self.connect_peer(peer, latency_ms, now);
        Ok(evicted)
    }

    /// Record the link and announce our tip over it
    pub fn connect_peer(&mut self, peer: NodeId, latency_ms: u64, now: u64) -> bool {
        self.now = self.now.max(now);
        if !self.peers.insert(Neighbor { node: peer, latency_ms, connected_at: now }) {
            return false;
        }
        tracing::info!("🔗 Node {} connected to {} ({}ms)", self.id, peer, latency_ms);
        self.emit(NodeEvent::PeerConnected { peer, latency_ms });
        self.announce_tip_to(peer);
        true
    }

    pub fn announce_tip_to(&mut self, peer: NodeId) {
        let Some(latency_ms) = self.peers.latency_to(peer) else { return };
        if let Some(tip) = self.chain.latest() {
            let message = GossipMessage::Block(tip.clone());
            self.outbox.push(NodeAction::Send { to: peer, latency_ms, message });
        }
    }

    /// Drop the link locally. The misbehavior score goes with it.
    pub fn disconnect(&mut self, peer: NodeId) -> bool {
        self.scores.clear(peer);
        if self.peers.remove(peer).is_none() {
            return false;
        }
        tracing::info!("🔌 Node {} disconnected from {}", self.id, peer);
        self.emit(NodeEvent::PeerDisconnected { peer });
        true
    }

    /// Close links older than the peer TTL, on both ends
    pub fn expire_peers(&mut self, now: u64) -> Vec<NodeId> {
        self.now = self.now.max(now);
        let expired = self.peers.expired(now, self.config.peer_ttl_ms);
        for &peer in &expired {
            self.disconnect(peer);
            self.outbox.push(NodeAction::Disconnect { peer });
        }
        expired
    }

    /// Forget dedup entries and buffered orphans past their TTL
    pub fn purge_histories(&mut self, now: u64) -> usize {
        self.seen_blocks.purge(now) + self.seen_txs.purge(now) + self.orphans.expire(now)
    }

    // ─── Consensus ───────────────────────────────────────────────────

    /// Switch to `next`. A hard change drops every block at or above the
    /// divergence height that fails the new rules, with its descendants,
    /// and rebuilds the ledger.
    ///
    /// Panics if the two versions share no history.
    pub fn change_consensus(&mut self, next: Arc<ConsensusVersion>) -> ForkKind {
        if next.hash == self.consensus.hash {
            return ForkKind::None;
        }
        let divergence = match divergence_height(&self.consensus, &next) {
            Ok(d) => d,
            Err(e) => panic!("node {} cannot move to consensus v{}: {}", self.id, next.version, e),
        };
        let height = self.height().max(0) as u64;
        let kind = match divergence {
            None => ForkKind::None,
            Some(d) => harder(are_compatible(&self.consensus, &next, d), are_compatible(&self.consensus, &next, height.max(d))),
        };

        let previous = std::mem::replace(&mut self.consensus, next);
        let mut pruned = 0;
        if let (ForkKind::Hard, Some(d)) = (kind, divergence) {
            pruned = self.prune_from(d as i64);
        }
        self.miner.discard_template();

        tracing::info!(
            "📜 Node {} consensus v{} → v{} ({:?} fork, {} blocks pruned, height {})",
            self.id,
            previous.version,
            self.consensus.version,
            kind,
            pruned,
            self.height()
        );
        self.emit(NodeEvent::ConsensusChanged { version: self.consensus.version, kind, pruned });
        kind
    }

    fn prune_from(&mut self, from: i64) -> usize {
        let before = self.chain.len();
        let consensus = self.consensus.clone();
        let mut banned: HashSet<Hash256> = HashSet::new();
        loop {
            let (tree, _) = self.chain.prune(|tree, parent, block| {
                !banned.contains(&block.hash)
                    && (block.height < from || check_block_rules(tree, &consensus, block, parent, None).is_ok())
            });
            self.chain = tree;
            match self.rebuild_ledger() {
                Ok(()) => break,
                Err(RejectReason::Ledger(LedgerError::Block(hash, rejection))) => {
                    tracing::warn!("🗑️ Node {} pruning {} after fork: {}", self.id, short_hex(&hash), rejection);
                    banned.insert(hash);
                }
                Err(e) => {
                    tracing::error!("💥 Node {} ledger rebuild after fork failed: {}", self.id, e);
                    break;
                }
            }
        }
        self.orphans.clear();
        self.seen_blocks.clear();
        self.refresh_mempool(Vec::new());
        before - self.chain.len()
    }

    // ─── Snapshots ───────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> NodeSnapshot {
        let mut block_log: Vec<(Hash256, Vec<String>)> =
            self.block_log.iter().map(|(h, notes)| (*h, notes.clone())).collect();
        block_log.sort();
        NodeSnapshot {
            id: self.id,
            consensus_version: self.consensus.version,
            mining_address: self.mining_address.clone(),
            mining: self.miner.is_mining(),
            config: self.config.clone(),
            chain: self.chain.to_snapshot(),
            ledger: self.ledger.to_snapshot(),
            mempool: self.mempool.get_pending(),
            block_log,
        }
    }

    /// Rebuild a node from a snapshot. Peer links are not part of it.
    pub fn restore(
        snapshot: NodeSnapshot,
        consensus: Arc<ConsensusVersion>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, ChainError> {
        let chain = ChainTree::from_snapshot(snapshot.chain)?;
        let ledger = Ledger::from_snapshot(snapshot.ledger, verifier.clone());
        let mut node = Node::new(snapshot.id, consensus, snapshot.mining_address, verifier, snapshot.config);
        node.chain = chain;
        node.ledger = ledger;
        node.block_log = snapshot.block_log.into_iter().collect();
        node.refresh_mempool(snapshot.mempool);
        if snapshot.mining {
            node.miner.start();
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::consensus::ConsensusRegistry;
    use crate::crypto::FormatVerifier;

    fn regtest_node(id: NodeId) -> Node {
        let registry = ConsensusRegistry::new(ConsensusParams::regtest());
        node_on(id, registry.genesis())
    }

    fn node_on(id: NodeId, consensus: Arc<ConsensusVersion>) -> Node {
        let config = NodeConfig { miner: MinerConfig { hash_rate: None, batch_size: 256 }, ..NodeConfig::default() };
        Node::new(id, consensus, format!("miner-{}", id), Arc::new(FormatVerifier), config)
    }

    /// Mine one block on the node's current tip without touching its miner
    fn solve_on(node: &Node, miner: NodeId, now: u64) -> Block {
        let mut block =
            create_block_template(node.chain(), node.consensus(), &[], miner, &format!("miner-{}", miner), now).unwrap();
        loop {
            block.hash = block.compute_hash();
            if block.meets_target() {
                return block;
            }
            block.nonce += 1;
        }
    }

    fn mine_blocks(node: &mut Node, count: usize) {
        for i in 0..count {
            let now = 1_000 * (node.height() + 2) as u64 + i as u64;
            let block = solve_on(node, node.id(), now);
            node.add_block(block, now).unwrap();
        }
    }

    #[test]
    fn test_genesis_credits_subsidy() {
        let mut node = regtest_node(0);
        let block = solve_on(&node, 0, 1_000);
        let accepted = node.add_block(block, 1_000).unwrap();
        assert_eq!(accepted.height, 0);
        assert!(accepted.tip_changed);
        assert_eq!(node.balance("miner-0"), 5_000_000_000);
    }

    #[test]
    fn test_header_rejections() {
        let mut node = regtest_node(0);
        let mut block = solve_on(&node, 0, 1_000);
        let good = block.clone();
        block.hash[0] ^= 1;
        assert_eq!(node.add_block(block, 1_000), Err(RejectReason::InvalidHash));

        let mut orphan = good.clone();
        orphan.height = 4;
        orphan.hash = orphan.compute_hash();
        while !orphan.meets_target() {
            orphan.nonce += 1;
            orphan.hash = orphan.compute_hash();
        }
        assert_eq!(node.add_block(orphan, 1_000), Err(RejectReason::OrphanBlock));

        node.add_block(good.clone(), 1_000).unwrap();
        assert_eq!(node.add_block(good, 1_000), Err(RejectReason::DuplicateBlock));
    }

    #[test]
    fn test_rule_rejections() {
        let mut node = regtest_node(0);
        mine_blocks(&mut node, 2);

        let mut bad_bits = solve_on(&node, 0, 10_000);
        bad_bits.bits = INITIAL_BITS;
        bad_bits.hash = bad_bits.compute_hash();
        while !bad_bits.meets_target() {
            bad_bits.nonce += 1;
            bad_bits.hash = bad_bits.compute_hash();
        }
        assert!(matches!(node.add_block(bad_bits, 10_000), Err(RejectReason::InvalidDifficultyBits { .. })));

        let far_future = 10_000 + MAX_FUTURE_DRIFT_MS + 1;
        let block = solve_on(&node, 0, far_future);
        assert_eq!(node.add_block(block, 10_000), Err(RejectReason::InvalidTimestamp(far_future)));
    }

    #[test]
    fn test_coinbase_overpay_is_ignored() {
        let mut node = regtest_node(0);
        let mut block = solve_on(&node, 0, 1_000);
        block.transactions[0] = Transaction::new_coinbase(0, "miner-0", 999 * COIN, 1_000);
        loop {
            block.hash = block.compute_hash();
            if block.meets_target() { break; }
            block.nonce += 1;
        }
        node.add_block(block, 1_000).unwrap();
        // the ledger credits subsidy + fees, not the declared value
        assert_eq!(node.balance("miner-0"), 50 * COIN);
    }

    #[test]
    fn test_zero_peer_mining() {
        let mut node = regtest_node(0);
        node.start_mining(0);
        let mut mined = 0;
        let mut now = 0;
        while mined < 3 && now < 100_000 {
            now += 100;
            if let Some(result) = node.process_mining_tick(now, None) {
                assert!(result.is_ok());
                mined += 1;
            }
        }
        assert_eq!(node.height(), 2);
        assert!(node.drain_actions().is_empty(), "no peers to broadcast to");
        assert_eq!(node.balance("miner-0"), 3 * 50 * COIN);
    }

    #[test]
    fn test_receive_requires_peer_and_dedups() {
        let mut source = regtest_node(1);
        mine_blocks(&mut source, 1);
        let block = source.chain().latest().cloned().unwrap();

        let mut node = regtest_node(0);
        assert_eq!(node.receive_block(1, block.clone(), 2_000), ReceiveOutcome::Ignored);

        node.connect_peer(1, 40, 0);
        node.connect_peer(2, 60, 0);
        node.drain_actions();
        assert!(matches!(node.receive_block(1, block.clone(), 2_000), ReceiveOutcome::Accepted(_)));
        let relayed = node.drain_actions();
        assert_eq!(relayed.len(), 1);
        assert!(matches!(relayed[0], NodeAction::Send { to: 2, latency_ms: 60, .. }));

        assert_eq!(node.receive_block(1, block.clone(), 2_100), ReceiveOutcome::Ignored);
        assert_eq!(node.receive_block(2, block, 2_200), ReceiveOutcome::Known);
        assert_eq!(node.chain().len(), 1);
    }

    #[test]
    fn test_rejected_orphan_scores_its_sender() {
        let mut source = regtest_node(1);
        mine_blocks(&mut source, 1);
        let first = source.chain().latest().cloned().unwrap();
        mine_blocks(&mut source, 1);
        let second = source.chain().latest().cloned().unwrap();

        // child of `second` stamped before its parents
        let mut child = solve_on(&source, 2, 10_000);
        child.timestamp = 1;
        loop {
            child.hash = child.compute_hash();
            if child.meets_target() { break; }
            child.nonce += 1;
        }

        let mut node = regtest_node(0);
        node.add_block(first, 5_000).unwrap();
        node.connect_peer(1, 40, 0);
        node.connect_peer(2, 60, 0);
        node.drain_actions();

        assert_eq!(node.receive_block(2, child.clone(), 5_000), ReceiveOutcome::Orphaned { missing: second.hash });
        assert!(matches!(node.receive_block(1, second, 5_100), ReceiveOutcome::Accepted(_)));
        assert_eq!(node.height(), 1);
        assert!(!node.chain().contains_hash(&child.hash));
        assert!(node.orphans().is_empty());
        assert_eq!(node.peer_score(2), MISBEHAVIOR_PENALTY);
        assert_eq!(node.peer_score(1), 0);
    }

    #[test]
    fn test_full_node_evicts_oldest_on_inbound() {
        let registry = ConsensusRegistry::new(ConsensusParams::regtest());
        let genesis = registry.genesis();
        let config = NodeConfig { peer_capacity: 2, ..NodeConfig::default() };
        let mut node = Node::new(0, genesis.clone(), "miner-0".into(), Arc::new(FormatVerifier), config);
        node.connect_peer(1, 40, 0);
        node.connect_peer(2, 40, 100);
        node.drain_actions();
        let mut rng = rand::thread_rng();

        let evicted = node.accept_connection(3, &genesis, 30, 200, |_| 1, &mut rng).unwrap();
        assert_eq!(evicted, Some(1));
        assert!(node.peers().contains(3));
        assert!(node.peers().contains(2));
        assert!(!node.peers().contains(1));
        assert!(node.drain_actions().contains(&NodeAction::Disconnect { peer: 1 }));

        // already linked: nothing changes
        assert_eq!(node.accept_connection(2, &genesis, 30, 300, |_| 1, &mut rng), Ok(None));
        assert_eq!(node.peer_count(), 2);
    }

    #[test]
    fn test_transaction_dedup_per_peer_and_relay() {
        let mut node = regtest_node(0);
        mine_blocks(&mut node, 1);
        let coinbase = node.chain().latest().unwrap().transactions[0].clone();
        let mut tx = Transaction::new(
            vec![TxInput {
                previous_output: OutPoint { tx_id: coinbase.id, output_index: 0 },
                address: coinbase.outputs[0].address.clone(),
                value: coinbase.outputs[0].value,
                signature: vec![1; 64],
                public_key: vec![2; 32],
            }],
            vec![TxOutput { address: "bob".into(), value: 50 * COIN - 1_000 }],
            5,
        );
        tx.id = tx.compute_id();

        node.connect_peer(1, 40, 0);
        node.connect_peer(2, 60, 0);
        node.drain_actions();

        assert_eq!(node.receive_transaction(7, tx.clone(), 3_000), Ok(false), "not a peer");
        assert_eq!(node.receive_transaction(1, tx.clone(), 3_000), Ok(true));
        let relayed = node.drain_actions();
        assert_eq!(relayed.len(), 1);
        assert!(matches!(relayed[0], NodeAction::Send { to: 2, latency_ms: 60, message: GossipMessage::Transaction(_) }));

        assert_eq!(node.receive_transaction(1, tx.clone(), 3_100), Ok(false));
        assert_eq!(node.receive_transaction(2, tx, 3_200), Ok(false));
        assert!(node.drain_actions().is_empty());
        assert_eq!(node.mempool().len(), 1);
    }

    #[test]
    fn test_pending_chain_and_template() {
        let mut node = regtest_node(0);
        mine_blocks(&mut node, 1);
        let coinbase = node.chain().latest().unwrap().transactions[0].clone();
        let spend = |prev: &Transaction, value: u64| {
            let mut tx = Transaction::new(
                vec![TxInput {
                    previous_output: OutPoint { tx_id: prev.id, output_index: 0 },
                    address: prev.outputs[0].address.clone(),
                    value: prev.outputs[0].value,
                    signature: vec![1; 64],
                    public_key: vec![2; 32],
                }],
                vec![TxOutput { address: "bob".into(), value }],
                5,
            );
            tx.id = tx.compute_id();
            tx
        };
        let first = spend(&coinbase, 50 * COIN - 1_000);
        let second = spend(&first, 50 * COIN - 3_000);
        node.add_transaction(first.clone()).unwrap();
        node.add_transaction(second.clone()).unwrap();
        assert!(matches!(
            node.add_transaction(first),
            Err(RejectReason::TransactionRejected { reason: TxRejectReason::DuplicateTransaction, .. })
        ));
        assert_eq!(node.mempool().len(), 2);

        node.start_mining(5_000);
        assert_eq!(node.miner().template().unwrap().transactions.len(), 3);
        let mut now = 5_000;
        while node.height() < 1 {
            now += 100;
            node.process_mining_tick(now, None);
        }
        assert!(node.mempool().is_empty());
        assert_eq!(node.balance("bob"), 50 * COIN - 3_000);
        // subsidy + both fees
        assert_eq!(node.balance("miner-0"), 50 * COIN + 3_000);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut node = regtest_node(3);
        mine_blocks(&mut node, 4);
        let snapshot = node.to_snapshot();
        let bytes = bincode::serialize(&snapshot).unwrap();
        let decoded: NodeSnapshot = bincode::deserialize(&bytes).unwrap();
        let restored = Node::restore(decoded, node.consensus().clone(), Arc::new(FormatVerifier)).unwrap();
        assert_eq!(restored.tip_hash(), node.tip_hash());
        assert_eq!(restored.balance("miner-3"), node.balance("miner-3"));
        assert_eq!(restored.peer_count(), 0);
    }

    #[test]
    fn test_soft_fork_keeps_chain() {
        let mut registry = ConsensusRegistry::new(ConsensusParams::regtest());
        let genesis = registry.genesis();
        let mut node = node_on(0, genesis.clone());
        mine_blocks(&mut node, 6);

        let tighter = ConsensusParams { max_transactions: 1_000, ..ConsensusParams::regtest() };
        let next = registry.publish_upgrade(genesis.version, 2, tighter).unwrap();
        assert_eq!(node.change_consensus(next), ForkKind::Soft);
        assert_eq!(node.height(), 5);
        assert_eq!(node.consensus().version, 2);
    }

    #[test]
    fn test_hard_fork_prunes_from_divergence() {
        let mut registry = ConsensusRegistry::new(ConsensusParams::regtest());
        let genesis = registry.genesis();
        let mut node = node_on(0, genesis.clone());
        mine_blocks(&mut node, 6);
        let tip_before = node.tip_hash();

        let faster = ConsensusParams { difficulty_adjustment_interval: 2, ..ConsensusParams::regtest() };
        let next = registry.publish_upgrade(genesis.version, 2, faster).unwrap();
        assert_eq!(node.change_consensus(next), ForkKind::Hard);

        // blocks from #2 up were built under rules the new version rejects
        assert_eq!(node.height(), 1);
        assert_ne!(node.tip_hash(), tip_before);
        assert_eq!(node.balance("miner-0"), 2 * 50 * COIN);
        assert!(node.ledger().state().check_invariants());

        // mining resumes on the pruned tip under the new rules
        let block = solve_on(&node, 0, 20_000);
        assert!(node.add_block(block, 20_000).is_ok());
        assert_eq!(node.height(), 2);
    }

    #[test]
    fn test_incompatible_candidates_skipped() {
        let mut registry = ConsensusRegistry::new(ConsensusParams::regtest());
        let genesis = registry.genesis();
        let hard = registry
            .publish_upgrade(genesis.version, 0, ConsensusParams { target_block_time: 99, ..ConsensusParams::regtest() })
            .unwrap();
        let node = node_on(0, genesis.clone());
        let candidates = vec![
            PeerCandidate { id: 1, consensus: genesis.clone() },
            PeerCandidate { id: 2, consensus: hard },
            PeerCandidate { id: 0, consensus: genesis },
        ];
        let mut rng = rand::thread_rng();
        assert_eq!(node.search_peers_to_connect(&candidates, &mut rng), vec![1]);
    }
}
