use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

use crate::core::consensus::{ConsensusError, ConsensusVersion};
use crate::core::difficulty;
use crate::core::params::MEDIAN_TIME_SPAN;
use crate::core::types::*;

/// Index of a block in the tree's arena
pub type BlockId = usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("parent block not known")]
    OrphanBlock,
    #[error("block already known")]
    DuplicateBlock,
    #[error("invalid chain snapshot: {0}")]
    InvalidSnapshot(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockNode {
    pub block: Block,
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,
    pub is_active: bool,
    /// Propagation latency from this node to the block's miner (0 for own blocks)
    pub latency: u64,
}

/// All retained blocks at one height, in fork-choice order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeightSlot {
    pub n: i64,
    pub blocks: Vec<BlockId>,
}

/// Change of selected chain caused by one insertion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reorg {
    /// Highest first
    pub reverted: Vec<BlockId>,
    /// Lowest first
    pub applied: Vec<BlockId>,
}

impl Reorg {
    pub fn is_empty(&self) -> bool { self.reverted.is_empty() && self.applied.is_empty() }
    pub fn depth(&self) -> usize { self.reverted.len() }
}

#[derive(Debug, Clone)]
pub struct Attached {
    pub id: BlockId,
    pub tip_changed: bool,
    pub reorg: Reorg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub nodes: Vec<BlockNode>,
    pub index: Vec<HeightSlot>,
    pub tip: BlockId,
}

// ─── Chain Tree ─────────────────────────────────────────────────────

/// Every block a node has accepted, rooted at a synthetic origin.
///
/// Blocks live in an arena and refer to each other by `BlockId`. The height
/// index keeps each level ordered so that the first block at the highest
/// level is the tip of the selected chain.
#[derive(Clone)]
pub struct ChainTree {
    nodes: Vec<BlockNode>,
    index: VecDeque<HeightSlot>,
    by_hash: HashMap<Hash256, BlockId>,
    tip: BlockId,
}

impl std::fmt::Debug for ChainTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainTree")
            .field("height", &self.height())
            .field("tip", &short_hex(&self.block(self.tip).hash))
            .field("known_blocks", &(self.nodes.len() - 1))
            .finish()
    }
}

impl Default for ChainTree {
    fn default() -> Self { Self::new() }
}

const ORIGIN: BlockId = 0;

impl ChainTree {
    pub fn new() -> Self {
        let origin = BlockNode { block: Block::origin(), parent: None, children: vec![], is_active: true, latency: 0 };
        let mut by_hash = HashMap::new();
        by_hash.insert(NULL_HASH, ORIGIN);
        ChainTree {
            nodes: vec![origin],
            index: VecDeque::from(vec![HeightSlot { n: ORIGIN_HEIGHT, blocks: vec![ORIGIN] }]),
            by_hash,
            tip: ORIGIN,
        }
    }

    pub fn origin(&self) -> BlockId { ORIGIN }
    pub fn node(&self, id: BlockId) -> &BlockNode { &self.nodes[id] }
    pub fn block(&self, id: BlockId) -> &Block { &self.nodes[id].block }
    pub fn tip_id(&self) -> BlockId { self.tip }
    /// Number of real blocks (origin excluded)
    pub fn len(&self) -> usize { self.nodes.len() - 1 }
    pub fn is_empty(&self) -> bool { self.nodes.len() == 1 }
    pub fn contains_hash(&self, hash: &Hash256) -> bool { self.by_hash.contains_key(hash) }
    pub fn find_by_hash(&self, hash: &Hash256) -> Option<BlockId> { self.by_hash.get(hash).copied() }
    pub fn block_by_hash(&self, hash: &Hash256) -> Option<&Block> { self.find_by_hash(hash).map(|id| self.block(id)) }

    /// Tip of the selected chain, `None` while only the origin exists
    pub fn latest(&self) -> Option<&Block> {
        if self.tip == ORIGIN { None } else { Some(self.block(self.tip)) }
    }

    /// Height of the selected tip (-1 when empty)
    pub fn height(&self) -> i64 { self.block(self.tip).height }

    pub fn min_height(&self) -> i64 { self.index.front().map_or(ORIGIN_HEIGHT, |s| s.n) }
    pub fn max_height(&self) -> i64 { self.index.back().map_or(ORIGIN_HEIGHT, |s| s.n) }

    fn slot_index(&self, height: i64) -> Option<usize> {
        let first = self.index.front()?.n;
        let i = height - first;
        if i < 0 || i as usize >= self.index.len() { None } else { Some(i as usize) }
    }

    pub fn slot(&self, height: i64) -> Option<&HeightSlot> {
        self.slot_index(height).map(|i| &self.index[i])
    }

    /// Blocks at a height in fork-choice order
    pub fn blocks_at(&self, height: i64) -> &[BlockId] {
        self.slot(height).map_or(&[][..], |s| s.blocks.as_slice())
    }

    pub fn active_at(&self, height: i64) -> Vec<BlockId> {
        self.blocks_at(height).iter().copied().filter(|&id| self.nodes[id].is_active).collect()
    }

    pub fn find(&self, height: i64, hash: &Hash256) -> Option<BlockId> {
        self.find_by_hash(hash).filter(|&id| self.nodes[id].block.height == height)
    }

    fn slot_mut_or_insert(&mut self, height: i64) -> &mut HeightSlot {
        while height < self.min_height() {
            let n = self.min_height() - 1;
            self.index.push_front(HeightSlot { n, blocks: vec![] });
        }
        while height > self.max_height() {
            let n = self.max_height() + 1;
            self.index.push_back(HeightSlot { n, blocks: vec![] });
        }
        let i = (height - self.min_height()) as usize;
        &mut self.index[i]
    }

    /// Attach a block under its parent and re-derive fork choice.
    pub fn add_block(&mut self, block: Block, latency: u64) -> Result<Attached, ChainError> {
        let parent = self.find(block.height - 1, &block.previous_hash).ok_or(ChainError::OrphanBlock)?;
        if self.contains_hash(&block.hash) {
            return Err(ChainError::DuplicateBlock);
        }

        let id = self.nodes.len();
        let height = block.height;
        self.by_hash.insert(block.hash, id);
        self.nodes.push(BlockNode { block, parent: Some(parent), children: vec![], is_active: false, latency });
        self.nodes[parent].children.push(id);
        self.slot_mut_or_insert(height).blocks.push(id);

        let old_tip = self.tip;
        self.refresh_from(height);
        self.tip = self.compute_tip();
        let reorg = self.path_diff(old_tip, self.tip);
        Ok(Attached { id, tip_changed: old_tip != self.tip, reorg })
    }

    /// Walk down from `height`, recomputing active flags and order, until a
    /// level below the insertion point comes out unchanged.
    fn refresh_from(&mut self, height: i64) {
        let max = self.max_height();
        let min = self.min_height();
        let mut h = height.min(max);
        while h >= min {
            let changed = self.refresh_level(h, max);
            if h < height && !changed {
                break;
            }
            h -= 1;
        }
    }

    fn refresh_level(&mut self, height: i64, max: i64) -> bool {
        let Some(i) = self.slot_index(height) else { return false };
        let nodes = &mut self.nodes;
        let slot = &mut self.index[i];
        let mut changed = false;
        for &id in &slot.blocks {
            let active = id == ORIGIN
                || (height == max && nodes[id].children.is_empty())
                || nodes[id].children.iter().any(|&c| nodes[c].is_active);
            if nodes[id].is_active != active {
                nodes[id].is_active = active;
                changed = true;
            }
        }
        let before = slot.blocks.clone();
        slot.blocks.sort_by_key(|&id| (!nodes[id].is_active, nodes[id].latency));
        changed || before != slot.blocks
    }

    fn compute_tip(&self) -> BlockId {
        self.index
            .iter()
            .rev()
            .find_map(|s| s.blocks.first().copied())
            .unwrap_or(ORIGIN)
    }

    /// Selected chain from `id` down to (not including) the origin, highest first
    pub fn path_to(&self, id: BlockId) -> Vec<BlockId> {
        let mut path = Vec::new();
        let mut cur = id;
        while cur != ORIGIN {
            path.push(cur);
            match self.nodes[cur].parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        path
    }

    /// Selected chain lowest first
    pub fn selected_chain(&self) -> Vec<BlockId> {
        let mut path = self.path_to(self.tip);
        path.reverse();
        path
    }

    /// Blocks to revert and apply to move from `from` to `to`
    pub fn path_diff(&self, from: BlockId, to: BlockId) -> Reorg {
        let mut reorg = Reorg::default();
        let (mut a, mut b) = (from, to);
        let height = |id: BlockId| self.nodes[id].block.height;
        while height(a) > height(b) {
            reorg.reverted.push(a);
            a = self.nodes[a].parent.unwrap_or(ORIGIN);
        }
        while height(b) > height(a) {
            reorg.applied.push(b);
            b = self.nodes[b].parent.unwrap_or(ORIGIN);
        }
        while a != b {
            reorg.reverted.push(a);
            reorg.applied.push(b);
            a = self.nodes[a].parent.unwrap_or(ORIGIN);
            b = self.nodes[b].parent.unwrap_or(ORIGIN);
        }
        reorg.applied.reverse();
        reorg
    }

    /// Changes needed to make `to` the ledger's tip
    pub fn diff_to(&self, to: BlockId) -> Reorg { self.path_diff(self.tip, to) }

    pub fn ancestor_at(&self, id: BlockId, height: i64) -> Option<BlockId> {
        let mut cur = id;
        loop {
            let h = self.nodes[cur].block.height;
            if h == height {
                return Some(cur);
            }
            if h < height {
                return None;
            }
            cur = self.nodes[cur].parent?;
        }
    }

    /// Median timestamp of `id` and up to `span - 1` of its ancestors; 0 at the origin
    pub fn median_time_past(&self, id: BlockId, span: usize) -> u64 {
        let mut times: Vec<u64> = self
            .path_to(id)
            .into_iter()
            .take(span)
            .map(|b| self.nodes[b].block.timestamp)
            .collect();
        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    pub fn mtp(&self, id: BlockId) -> u64 { self.median_time_past(id, MEDIAN_TIME_SPAN) }

    /// Every real block, lowest height first, with the latency it was stored with
    pub fn blocks_in_height_order(&self) -> Vec<(Block, u64)> {
        self.index
            .iter()
            .flat_map(|s| s.blocks.iter())
            .filter(|&&id| id != ORIGIN)
            .map(|&id| (self.nodes[id].block.clone(), self.nodes[id].latency))
            .collect()
    }

    /// Rebuild the tree keeping only blocks `keep` accepts. A dropped block
    /// takes its descendants with it. `keep` sees the tree built so far.
    pub fn prune<F>(&self, mut keep: F) -> (ChainTree, usize)
    where
        F: FnMut(&ChainTree, BlockId, &Block) -> bool,
    {
        let mut tree = ChainTree::new();
        let mut dropped = 0;
        for (block, latency) in self.blocks_in_height_order() {
            let Some(parent) = tree.find(block.height - 1, &block.previous_hash) else {
                dropped += 1;
                continue;
            };
            if !keep(&tree, parent, &block) || tree.add_block(block, latency).is_err() {
                dropped += 1;
            }
        }
        (tree, dropped)
    }

    // ─── Difficulty ──────────────────────────────────────────────────

    /// Bits required of a block whose parent is `parent`
    pub fn next_bits(&self, parent: BlockId, consensus: &ConsensusVersion) -> Result<u32, ConsensusError> {
        let parent_block = self.block(parent);
        let height = parent_block.height + 1;
        let epoch = consensus.consensus_for_height(height as u64)?;
        let params = &epoch.params;
        if parent_block.is_origin() {
            return Ok(params.initial_bits);
        }
        let into_epoch = height as u64 - epoch.start_height;
        let interval = params.difficulty_adjustment_interval.max(1);
        if into_epoch == 0 || into_epoch % interval != 0 {
            return Ok(parent_block.bits);
        }
        let first_height = (parent_block.height - interval as i64).max(epoch.start_height as i64);
        let first = self.ancestor_at(parent, first_height).unwrap_or(parent);
        let actual = parent_block.timestamp.saturating_sub(self.block(first).timestamp);
        Ok(difficulty::retarget(parent_block.bits, actual, params.expected_timespan_ms(), params.pow_limit_bits))
    }

    /// Whether a block at `height` is the first of a retarget window
    pub fn is_retarget_height(height: i64, consensus: &ConsensusVersion) -> bool {
        if height <= 0 {
            return false;
        }
        match consensus.consensus_for_height(height as u64) {
            Ok(epoch) => {
                let into_epoch = height as u64 - epoch.start_height;
                into_epoch > 0 && into_epoch % epoch.params.difficulty_adjustment_interval.max(1) == 0
            }
            Err(_) => false,
        }
    }

    // ─── Snapshots ───────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> ChainSnapshot {
        ChainSnapshot { nodes: self.nodes.clone(), index: self.index.iter().cloned().collect(), tip: self.tip }
    }

    pub fn from_snapshot(snapshot: ChainSnapshot) -> Result<Self, ChainError> {
        let bad = |msg: &str| ChainError::InvalidSnapshot(msg.to_string());
        let nodes = snapshot.nodes;
        if nodes.is_empty() || !nodes[ORIGIN].block.is_origin() || nodes[ORIGIN].parent.is_some() {
            return Err(bad("missing origin"));
        }
        if snapshot.tip >= nodes.len() {
            return Err(bad("tip out of range"));
        }
        let mut by_hash = HashMap::with_capacity(nodes.len());
        for (id, node) in nodes.iter().enumerate() {
            if by_hash.insert(node.block.hash, id).is_some() {
                return Err(bad("duplicate block hash"));
            }
            if id != ORIGIN {
                let parent = node.parent.filter(|&p| p < nodes.len()).ok_or_else(|| bad("dangling parent"))?;
                if !nodes[parent].children.contains(&id) || nodes[parent].block.height + 1 != node.block.height {
                    return Err(bad("parent link mismatch"));
                }
            }
            if node.children.iter().any(|&c| c >= nodes.len() || nodes[c].parent != Some(id)) {
                return Err(bad("child link mismatch"));
            }
        }
        let mut expected = None;
        for slot in &snapshot.index {
            if expected.map_or(false, |n| n != slot.n) {
                return Err(bad("height index not contiguous"));
            }
            expected = Some(slot.n + 1);
            if slot.blocks.iter().any(|&id| id >= nodes.len() || nodes[id].block.height != slot.n) {
                return Err(bad("height index mismatch"));
            }
        }
        Ok(ChainTree { nodes, index: snapshot.index.into_iter().collect(), by_hash, tip: snapshot.tip })
    }
}
