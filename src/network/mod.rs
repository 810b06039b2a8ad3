//! Simulated peer gossip.
//!
//! Nodes never touch each other directly: they queue `NodeAction`s that the
//! simulation turns into delayed deliveries. This module holds the per-node
//! bookkeeping that protocol needs: the neighbor table, misbehavior scores,
//! duplicate-delivery history, the orphan buffer and the mempool.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::consensus::ConsensusVersion;
use crate::core::params::*;
use crate::core::types::*;

pub mod scheduler;

// ─── Message Types ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    Block(Block),
    Transaction(Transaction),
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Block(_) => "block",
            GossipMessage::Transaction(_) => "tx",
        }
    }
}

/// Side effects a node asks the simulation to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    Send { to: NodeId, latency_ms: u64, message: GossipMessage },
    /// Drop the link on the other side too
    Disconnect { peer: NodeId },
}

/// Fetches blocks from peers during catch-up
pub trait BlockSource {
    fn request_block(&self, peer: NodeId, hash: &Hash256) -> Option<Block>;
}

/// A node that could be connected to
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub id: NodeId,
    pub consensus: Arc<ConsensusVersion>,
}

// ─── Neighbor Table ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node: NodeId,
    pub latency_ms: u64,
    pub connected_at: u64,
}

/// Peer slot count for a new node, uniform in `MIN_PEER_SLOTS..=MAX_PEER_SLOTS`
pub fn random_peer_capacity<R: Rng + ?Sized>(rng: &mut R) -> usize {
    rng.gen_range(MIN_PEER_SLOTS..=MAX_PEER_SLOTS)
}

/// Fixed-capacity set of connected peers
#[derive(Debug, Clone)]
pub struct PeerTable {
    capacity: usize,
    neighbors: Vec<Neighbor>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, neighbors: Vec::with_capacity(capacity) }
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn len(&self) -> usize { self.neighbors.len() }
    pub fn is_empty(&self) -> bool { self.neighbors.is_empty() }
    pub fn is_full(&self) -> bool { self.neighbors.len() >= self.capacity }
    pub fn free_slots(&self) -> usize { self.capacity.saturating_sub(self.neighbors.len()) }
    pub fn contains(&self, node: NodeId) -> bool { self.get(node).is_some() }
    pub fn get(&self, node: NodeId) -> Option<&Neighbor> { self.neighbors.iter().find(|n| n.node == node) }
    pub fn latency_to(&self, node: NodeId) -> Option<u64> { self.get(node).map(|n| n.latency_ms) }
    pub fn ids(&self) -> Vec<NodeId> { self.neighbors.iter().map(|n| n.node).collect() }
    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> { self.neighbors.iter() }

    /// Add a neighbor. Fails when full or already connected.
    pub fn insert(&mut self, neighbor: Neighbor) -> bool {
        if self.is_full() || self.contains(neighbor.node) {
            return false;
        }
        self.neighbors.push(neighbor);
        true
    }

    pub fn remove(&mut self, node: NodeId) -> Option<Neighbor> {
        let pos = self.neighbors.iter().position(|n| n.node == node)?;
        Some(self.neighbors.remove(pos))
    }

    /// Peers whose connection is at least `ttl_ms` old
    pub fn expired(&self, now: u64, ttl_ms: u64) -> Vec<NodeId> {
        self.neighbors
            .iter()
            .filter(|n| now.saturating_sub(n.connected_at) >= ttl_ms)
            .map(|n| n.node)
            .collect()
    }

    /// Pick the neighbor to drop for a newcomer: oldest connection, then the
    /// one with the most connections of its own, then at random.
    pub fn select_eviction<R, F>(&self, degree_of: F, rng: &mut R) -> Option<NodeId>
    where
        R: Rng + ?Sized,
        F: Fn(NodeId) -> usize,
    {
        let oldest = self.neighbors.iter().map(|n| n.connected_at).min()?;
        let aged: Vec<NodeId> = self
            .neighbors
            .iter()
            .filter(|n| n.connected_at == oldest)
            .map(|n| n.node)
            .collect();
        let busiest = aged.iter().map(|&id| degree_of(id)).max()?;
        let tied: Vec<NodeId> = aged.into_iter().filter(|&id| degree_of(id) == busiest).collect();
        tied.choose(rng).copied()
    }
}

// ─── Misbehavior Scores ──────────────────────────────────────────────

/// Misbehavior points per peer. Reaching the threshold means disconnect;
/// the score is cleared with the connection.
#[derive(Debug, Clone)]
pub struct PeerScoreboard {
    scores: HashMap<NodeId, u32>,
    penalty: u32,
    threshold: u32,
}

impl Default for PeerScoreboard {
    fn default() -> Self { Self::new(MISBEHAVIOR_PENALTY, MISBEHAVIOR_THRESHOLD) }
}

impl PeerScoreboard {
    pub fn new(penalty: u32, threshold: u32) -> Self {
        Self { scores: HashMap::new(), penalty, threshold }
    }

    /// Record an offense. Returns true if the peer should be disconnected.
    pub fn record_offense(&mut self, peer: NodeId) -> bool {
        let score = self.scores.entry(peer).or_insert(0);
        *score = score.saturating_add(self.penalty);
        *score >= self.threshold
    }

    pub fn score(&self, peer: NodeId) -> u32 { self.scores.get(&peer).copied().unwrap_or(0) }
    pub fn clear(&mut self, peer: NodeId) { self.scores.remove(&peer); }
}

// ─── Duplicate Suppression ───────────────────────────────────────────

#[derive(Debug, Clone)]
struct SeenEntry {
    from: HashSet<NodeId>,
    first_seen: u64,
}

/// Which peers each item was received from, forgotten after a TTL
#[derive(Debug, Clone)]
pub struct SeenHistory {
    entries: HashMap<Hash256, SeenEntry>,
    ttl_ms: u64,
}

impl Default for SeenHistory {
    fn default() -> Self { Self::new(DEDUP_TTL_MS) }
}

impl SeenHistory {
    pub fn new(ttl_ms: u64) -> Self {
        Self { entries: HashMap::new(), ttl_ms }
    }

    /// Record a delivery. Returns false if this peer already delivered it.
    pub fn record(&mut self, hash: Hash256, from: NodeId, now: u64) -> bool {
        let ttl = self.ttl_ms;
        let entry = self.entries.entry(hash).or_insert_with(|| SeenEntry { from: HashSet::new(), first_seen: now });
        if now.saturating_sub(entry.first_seen) >= ttl {
            entry.from.clear();
            entry.first_seen = now;
        }
        entry.from.insert(from)
    }

    pub fn contains(&self, hash: &Hash256) -> bool { self.entries.contains_key(hash) }

    pub fn senders(&self, hash: &Hash256) -> usize { self.entries.get(hash).map_or(0, |e| e.from.len()) }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub fn purge(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl_ms;
        self.entries.retain(|_, e| now.saturating_sub(e.first_seen) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn clear(&mut self) { self.entries.clear(); }
}

// ─── Orphan Blocks ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct OrphanEntry {
    block: Block,
    from: NodeId,
    received_at: u64,
}

/// Blocks whose parent is unknown, keyed by the missing parent hash.
/// Entries expire after a TTL; a full pool drops its oldest entry.
#[derive(Debug, Clone)]
pub struct OrphanPool {
    by_parent: HashMap<Hash256, Vec<OrphanEntry>>,
    // hash -> (missing parent, received_at)
    index: HashMap<Hash256, (Hash256, u64)>,
    capacity: usize,
    ttl_ms: u64,
}

impl Default for OrphanPool {
    fn default() -> Self { Self::new(MAX_ORPHAN_BLOCKS, ORPHAN_TTL_MS) }
}

impl OrphanPool {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self { by_parent: HashMap::new(), index: HashMap::new(), capacity: capacity.max(1), ttl_ms }
    }

    /// Buffer a block received from `from`. False if already buffered.
    pub fn insert(&mut self, block: Block, from: NodeId, now: u64) -> bool {
        if self.index.contains_key(&block.hash) {
            return false;
        }
        self.expire(now);
        while self.index.len() >= self.capacity {
            let Some(oldest) = self.oldest() else { break };
            self.remove(&oldest);
        }
        self.index.insert(block.hash, (block.previous_hash, now));
        self.by_parent
            .entry(block.previous_hash)
            .or_default()
            .push(OrphanEntry { block, from, received_at: now });
        true
    }

    fn oldest(&self) -> Option<Hash256> {
        self.index.iter().min_by_key(|(hash, entry)| (entry.1, **hash)).map(|(hash, _)| *hash)
    }

    /// Remove and return every block waiting on `parent`
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<(Block, NodeId)> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        for entry in &children {
            self.index.remove(&entry.block.hash);
        }
        children.into_iter().map(|e| (e.block, e.from)).collect()
    }

    /// Drop one buffered block, returning it with its sender
    pub fn remove(&mut self, hash: &Hash256) -> Option<(Block, NodeId)> {
        let (parent, _) = self.index.remove(hash)?;
        let siblings = self.by_parent.get_mut(&parent)?;
        let pos = siblings.iter().position(|e| &e.block.hash == hash)?;
        let entry = siblings.remove(pos);
        if siblings.is_empty() {
            self.by_parent.remove(&parent);
        }
        Some((entry.block, entry.from))
    }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub fn expire(&mut self, now: u64) -> usize {
        let ttl = self.ttl_ms;
        let stale: Vec<Hash256> = self
            .index
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.1) >= ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &stale {
            self.remove(hash);
        }
        stale.len()
    }

    /// A buffered block and the peer that sent it
    pub fn get(&self, hash: &Hash256) -> Option<(&Block, NodeId)> {
        let (parent, _) = self.index.get(hash)?;
        self.by_parent.get(parent)?.iter().find(|e| &e.block.hash == hash).map(|e| (&e.block, e.from))
    }

    pub fn contains(&self, hash: &Hash256) -> bool { self.index.contains_key(hash) }
    pub fn len(&self) -> usize { self.index.len() }
    pub fn is_empty(&self) -> bool { self.index.is_empty() }

    pub fn clear(&mut self) {
        self.by_parent.clear();
        self.index.clear();
    }
}

// ─── Mempool ────────────────────────────────────────────────────────

struct MempoolEntry {
    tx: Transaction,
    fee: u64,
}

/// Pending transactions in arrival order. Order matters: a transaction may
/// spend an output of an earlier pending one.
#[derive(Default)]
pub struct Mempool {
    order: Vec<Hash256>,
    entries: HashMap<Hash256, MempoolEntry>,
}

impl Mempool {
    pub fn new() -> Self { Self::default() }

    /// Add a pre-validated transaction with a known fee
    pub fn add_with_fee(&mut self, tx: Transaction, fee: u64) -> bool {
        if self.entries.contains_key(&tx.id) { return false; }
        self.order.push(tx.id);
        self.entries.insert(tx.id, MempoolEntry { tx, fee });
        true
    }

    pub fn contains(&self, id: &Hash256) -> bool { self.entries.contains_key(id) }

    pub fn get_pending(&self) -> Vec<Transaction> {
        self.order.iter().filter_map(|id| self.entries.get(id)).map(|e| e.tx.clone()).collect()
    }

    /// Empty the pool, returning transactions in arrival order
    pub fn drain(&mut self) -> Vec<Transaction> {
        let order = std::mem::take(&mut self.order);
        let mut entries = std::mem::take(&mut self.entries);
        order.into_iter().filter_map(|id| entries.remove(&id)).map(|e| e.tx).collect()
    }

    pub fn total_fees(&self) -> u64 { self.entries.values().map(|e| e.fee).sum() }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn block_with(prev: Hash256, salt: u8) -> Block {
        let mut b = Block::origin();
        b.height = 1;
        b.previous_hash = prev;
        b.hash = [salt; 32];
        b
    }

    #[test]
    fn test_peer_table_capacity() {
        let mut t = PeerTable::new(2);
        assert!(t.insert(Neighbor { node: 1, latency_ms: 10, connected_at: 0 }));
        assert!(!t.insert(Neighbor { node: 1, latency_ms: 10, connected_at: 0 }));
        assert!(t.insert(Neighbor { node: 2, latency_ms: 20, connected_at: 5 }));
        assert!(t.is_full());
        assert!(!t.insert(Neighbor { node: 3, latency_ms: 5, connected_at: 6 }));
        assert_eq!(t.latency_to(2), Some(20));
        assert_eq!(t.remove(1).map(|n| n.node), Some(1));
        assert_eq!(t.free_slots(), 1);
    }

    #[test]
    fn test_random_capacity_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let cap = random_peer_capacity(&mut rng);
            assert!((MIN_PEER_SLOTS..=MAX_PEER_SLOTS).contains(&cap));
        }
    }

    #[test]
    fn test_eviction_prefers_oldest_then_busiest() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut t = PeerTable::new(3);
        t.insert(Neighbor { node: 1, latency_ms: 10, connected_at: 100 });
        t.insert(Neighbor { node: 2, latency_ms: 10, connected_at: 50 });
        t.insert(Neighbor { node: 3, latency_ms: 10, connected_at: 50 });
        let degrees = |id: NodeId| if id == 3 { 3 } else { 1 };
        assert_eq!(t.select_eviction(degrees, &mut rng), Some(3));

        let flat = |_: NodeId| 2;
        let pick = t.select_eviction(flat, &mut rng).unwrap();
        assert!(pick == 2 || pick == 3);
        assert_eq!(PeerTable::new(2).select_eviction(flat, &mut rng), None);
    }

    #[test]
    fn test_expired_peers() {
        let mut t = PeerTable::new(3);
        t.insert(Neighbor { node: 1, latency_ms: 10, connected_at: 0 });
        t.insert(Neighbor { node: 2, latency_ms: 10, connected_at: 500 });
        assert_eq!(t.expired(PEER_TTL_MS, PEER_TTL_MS), vec![1]);
    }

    #[test]
    fn test_scoreboard_threshold() {
        let mut sb = PeerScoreboard::default();
        for _ in 0..4 {
            assert!(!sb.record_offense(9));
        }
        assert_eq!(sb.score(9), 200);
        assert!(sb.record_offense(9));
        sb.clear(9);
        assert_eq!(sb.score(9), 0);
    }

    #[test]
    fn test_seen_history_per_peer() {
        let mut seen = SeenHistory::new(1_000);
        let h = [1u8; 32];
        assert!(seen.record(h, 1, 0));
        assert!(!seen.record(h, 1, 10));
        assert!(seen.record(h, 2, 20));
        assert_eq!(seen.senders(&h), 2);
        // after the TTL the same peer counts as new again
        assert!(seen.record(h, 1, 1_000));
        assert_eq!(seen.purge(5_000), 1);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_orphan_pool() {
        let mut pool = OrphanPool::new(3, 1_000);
        let parent = [7u8; 32];
        assert!(pool.insert(block_with(parent, 1), 4, 0));
        assert!(!pool.insert(block_with(parent, 1), 5, 10));
        assert!(pool.insert(block_with(parent, 2), 5, 20));
        assert_eq!(pool.get(&[2u8; 32]).map(|(_, from)| from), Some(5));
        let children = pool.take_children(&parent);
        assert_eq!(children.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_full_orphan_pool_drops_oldest() {
        let mut pool = OrphanPool::new(2, 10_000);
        assert!(pool.insert(block_with([1u8; 32], 1), 9, 0));
        assert!(pool.insert(block_with([2u8; 32], 2), 9, 5));
        assert!(pool.insert(block_with([3u8; 32], 3), 4, 10));
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&[1u8; 32]));
        assert!(pool.contains(&[3u8; 32]));
        assert!(pool.take_children(&[1u8; 32]).is_empty());
    }

    #[test]
    fn test_orphans_expire() {
        let mut pool = OrphanPool::new(10, 1_000);
        pool.insert(block_with([1u8; 32], 1), 2, 0);
        pool.insert(block_with([1u8; 32], 2), 2, 600);
        assert_eq!(pool.expire(1_200), 1);
        assert!(pool.contains(&[2u8; 32]));
        assert_eq!(pool.remove(&[2u8; 32]).map(|(b, _)| b.hash), Some([2u8; 32]));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_mempool_keeps_arrival_order() {
        let mut mp = Mempool::new();
        let txs: Vec<Transaction> = (0..3)
            .map(|i| Transaction::new(vec![], vec![TxOutput { address: "a".into(), value: i }], 0))
            .collect();
        mp.add_with_fee(txs[2].clone(), 1);
        mp.add_with_fee(txs[0].clone(), 500);
        mp.add_with_fee(txs[1].clone(), 10);
        assert!(!mp.add_with_fee(txs[1].clone(), 10));
        let ids: Vec<Hash256> = mp.get_pending().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![txs[2].id, txs[0].id, txs[1].id]);
        assert_eq!(mp.total_fees(), 511);
        assert_eq!(mp.drain().len(), 3);
        assert!(mp.is_empty());
    }
}
