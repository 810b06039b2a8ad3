//! The simulated network.
//!
//! `Simulation` owns every node, the shared delivery scheduler and the
//! consensus registry. Each tick delivers due messages, then runs each node's
//! mining tick in id order, then does housekeeping. Nodes only see each other
//! through scheduled deliveries and the read-only `PeerDirectory` used during
//! catch-up.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ConfigError, SimConfig, VerifierKind};
use crate::core::chain::ChainError;
use crate::core::consensus::{are_compatible, ConsensusError, ConsensusRegistry, ConsensusVersion, ForkKind};
use crate::core::params::*;
use crate::core::types::*;
use crate::crypto::{Ed25519Verifier, FormatVerifier, SignatureVerifier};
use crate::network::scheduler::{Delivery, Scheduler};
use crate::network::{random_peer_capacity, BlockSource, GossipMessage, NodeAction, PeerCandidate};
use crate::node::{Node, ReceiveOutcome};
use crate::storage::{LinkRecord, NetworkMeta, Storage, StorageError, SNAPSHOT_VERSION};
use crate::wallet::{Ed25519KeyDeriver, Wallet};

/// Fee attached to the simulated wallet payments
pub const PAYMENT_FEE: u64 = 1_000;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error("stored chain is invalid: {0}")]
    Chain(#[from] ChainError),
    #[error("unknown consensus version {0}")]
    UnknownVersion(u32),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("runtime error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimStats {
    pub ticks: u64,
    pub delivered: u64,
    /// Deliveries whose recipient no longer exists
    pub dropped: u64,
    pub blocks_mined: u64,
    pub blocks_discarded: u64,
    pub payments: u64,
    pub catch_ups: u64,
    pub failed_catch_ups: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub height: i64,
    pub tip: String,
    pub blocks: usize,
    pub peers: Vec<NodeId>,
    pub mempool: usize,
    pub orphans: usize,
    pub mining: bool,
    pub consensus_version: u32,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSummary {
    pub now: u64,
    pub converged: bool,
    pub stats: SimStats,
    pub nodes: Vec<NodeSummary>,
}

/// Read-only view of the other nodes, serving blocks during catch-up
pub struct PeerDirectory<'a> {
    nodes: &'a BTreeMap<NodeId, Node>,
}

impl BlockSource for PeerDirectory<'_> {
    fn request_block(&self, peer: NodeId, hash: &Hash256) -> Option<Block> {
        self.nodes.get(&peer)?.serve_block(hash)
    }
}

fn make_verifier(kind: VerifierKind) -> Arc<dyn SignatureVerifier> {
    match kind {
        VerifierKind::Format => Arc::new(FormatVerifier),
        VerifierKind::Ed25519 => Arc::new(Ed25519Verifier),
    }
}

pub struct Simulation {
    config: SimConfig,
    registry: ConsensusRegistry,
    nodes: BTreeMap<NodeId, Node>,
    wallets: BTreeMap<NodeId, Wallet>,
    deriver: Ed25519KeyDeriver,
    scheduler: Scheduler,
    verifier: Arc<dyn SignatureVerifier>,
    rng: StdRng,
    now: u64,
    next_id: NodeId,
    last_rediscovery: u64,
    next_payment_at: u64,
    stats: SimStats,
}

impl Simulation {
    /// Build `config.nodes` nodes on the genesis consensus, start the first
    /// `miner_count()` of them mining and run an initial peer discovery.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let registry = ConsensusRegistry::new(config.consensus.clone());
        let mut sim = Self::empty(config, registry);
        let miners = sim.config.miner_count();
        for i in 0..sim.config.nodes {
            sim.add_node(i < miners);
        }
        sim.rediscover();
        tracing::info!(
            "🚀 Simulation started: {} nodes ({} mining), seed {}",
            sim.nodes.len(),
            miners,
            sim.config.seed
        );
        Ok(sim)
    }

    fn empty(config: SimConfig, registry: ConsensusRegistry) -> Self {
        Self {
            deriver: Ed25519KeyDeriver::from_u64(config.seed),
            verifier: make_verifier(config.verifier),
            rng: StdRng::seed_from_u64(config.seed),
            next_payment_at: config.tx_interval_ms,
            config,
            registry,
            nodes: BTreeMap::new(),
            wallets: BTreeMap::new(),
            scheduler: Scheduler::new(),
            now: 0,
            next_id: 0,
            last_rediscovery: 0,
            stats: SimStats::default(),
        }
    }

    pub fn now(&self) -> u64 { self.now }
    pub fn config(&self) -> &SimConfig { &self.config }
    pub fn registry(&self) -> &ConsensusRegistry { &self.registry }
    pub fn stats(&self) -> &SimStats { &self.stats }
    pub fn node(&self, id: NodeId) -> Option<&Node> { self.nodes.get(&id) }
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> { self.nodes.get_mut(&id) }
    pub fn nodes(&self) -> impl Iterator<Item = &Node> { self.nodes.values() }
    pub fn node_ids(&self) -> Vec<NodeId> { self.nodes.keys().copied().collect() }
    pub fn wallet(&self, id: NodeId) -> Option<&Wallet> { self.wallets.get(&id) }
    pub fn pending_deliveries(&self) -> usize { self.scheduler.len() }

    // ─── Membership ──────────────────────────────────────────────────

    /// Add a node on the latest consensus version. It is linked up at the
    /// next rediscovery.
    pub fn add_node(&mut self, mining: bool) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let wallet = Wallet::derive(&self.deriver, id);
        let capacity = random_peer_capacity(&mut self.rng);
        let mut node = Node::new(
            id,
            self.registry.latest(),
            wallet.address().to_string(),
            self.verifier.clone(),
            self.config.node_config(capacity),
        );
        if mining {
            node.start_mining(self.now);
        }
        tracing::debug!("Node {} joined ({} peer slots, wallet {})", id, capacity, wallet.address());
        self.wallets.insert(id, wallet);
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node. Its pending deliveries are cancelled and its
    /// neighbors drop the link.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.wallets.remove(&id);
        let cancelled = self.scheduler.cancel_to(id);
        for peer in node.peers().ids() {
            if let Some(other) = self.nodes.get_mut(&peer) {
                other.disconnect(id);
            }
        }
        tracing::info!("🔌 Node {} left the network ({} deliveries cancelled)", id, cancelled);
        Some(node)
    }

    /// Link two nodes directly, bypassing discovery
    pub fn connect(&mut self, a: NodeId, b: NodeId, latency_ms: u64) -> bool {
        if a == b || !self.nodes.contains_key(&a) || !self.nodes.contains_key(&b) {
            return false;
        }
        let now = self.now;
        let linked = self.nodes.get_mut(&a).map_or(false, |n| n.connect_peer(b, latency_ms, now));
        if !linked {
            return false;
        }
        if !self.nodes.get_mut(&b).map_or(false, |n| n.connect_peer(a, latency_ms, now)) {
            if let Some(n) = self.nodes.get_mut(&a) {
                n.disconnect(b);
            }
            return false;
        }
        self.flush_actions(a);
        self.flush_actions(b);
        true
    }

    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        for (x, y) in [(a, b), (b, a)] {
            if let Some(node) = self.nodes.get_mut(&x) {
                node.disconnect(y);
            }
        }
        self.scheduler.cancel_between(a, b);
    }

    pub fn start_mining(&mut self, id: NodeId) -> Result<(), SimError> {
        let now = self.now;
        self.nodes.get_mut(&id).ok_or(SimError::UnknownNode(id))?.start_mining(now);
        Ok(())
    }

    pub fn stop_mining(&mut self, id: NodeId) -> Result<(), SimError> {
        self.nodes.get_mut(&id).ok_or(SimError::UnknownNode(id))?.stop_mining();
        Ok(())
    }

    /// Change the mean gap between random payments; 0 stops them
    pub fn set_tx_interval(&mut self, interval_ms: u64) {
        self.config.tx_interval_ms = interval_ms;
        self.next_payment_at = self.now + interval_ms;
    }

    pub fn stop_all_mining(&mut self) {
        for node in self.nodes.values_mut() {
            node.stop_mining();
        }
    }

    // ─── Clock ───────────────────────────────────────────────────────

    /// Advance the clock by one tick
    pub fn tick(&mut self) {
        self.now += self.config.tick_ms;
        self.stats.ticks += 1;

        for delivery in self.scheduler.pop_due(self.now) {
            self.deliver(delivery);
        }

        for id in self.node_ids() {
            self.mining_tick(id);
        }

        self.housekeeping();
    }

    /// Tick until `duration_ms` of simulated time has passed
    pub fn run_for(&mut self, duration_ms: u64) {
        let until = self.now + duration_ms;
        while self.now < until {
            self.tick();
        }
    }

    /// Tick until every message is delivered and all nodes agree on a tip,
    /// or `max_ms` passes. Mining should be stopped first.
    pub fn settle(&mut self, max_ms: u64) -> bool {
        let until = self.now + max_ms;
        while self.now < until {
            if self.scheduler.is_empty() && self.converged() {
                return true;
            }
            self.tick();
        }
        self.scheduler.is_empty() && self.converged()
    }

    /// Whether every node has the same tip
    pub fn converged(&self) -> bool {
        let mut tips = self.nodes.values().map(|n| n.tip_hash());
        match tips.next() {
            Some(first) => tips.all(|t| t == first),
            None => true,
        }
    }

    fn mining_tick(&mut self, id: NodeId) {
        let now = self.now;
        let Some(node) = self.nodes.get_mut(&id) else { return };
        match node.process_mining_tick(now, None) {
            Some(Ok(_)) => self.stats.blocks_mined += 1,
            Some(Err(_)) => self.stats.blocks_discarded += 1,
            None => {}
        }
        self.flush_actions(id);
    }

    fn deliver(&mut self, delivery: Delivery) {
        let now = self.now;
        let Delivery { from, to, message } = delivery;
        let Some(node) = self.nodes.get_mut(&to) else {
            self.stats.dropped += 1;
            return;
        };
        self.stats.delivered += 1;
        match message {
            GossipMessage::Block(block) => {
                let orphan = block.clone();
                if let ReceiveOutcome::Orphaned { .. } = node.receive_block(from, block, now) {
                    self.catch_up(to, orphan, from);
                }
            }
            GossipMessage::Transaction(tx) => {
                if let Err(reason) = node.receive_transaction(from, tx, now) {
                    tracing::debug!("Node {} declined tx from {}: {}", to, from, reason);
                }
            }
        }
        self.flush_actions(to);
    }

    /// Take the node out of the map so it can read its peers while syncing
    fn catch_up(&mut self, id: NodeId, orphan: Block, from: NodeId) {
        let Some(mut node) = self.nodes.remove(&id) else { return };
        let directory = PeerDirectory { nodes: &self.nodes };
        let result = node.catch_up_orphan(orphan, from, &directory, self.now);
        self.nodes.insert(id, node);
        match result {
            Ok(_) => self.stats.catch_ups += 1,
            Err(_) => self.stats.failed_catch_ups += 1,
        }
        self.flush_actions(id);
    }

    /// Turn a node's queued actions into scheduled deliveries and link drops
    fn flush_actions(&mut self, id: NodeId) {
        let actions = match self.nodes.get_mut(&id) {
            Some(node) => node.drain_actions(),
            None => return,
        };
        for action in actions {
            match action {
                NodeAction::Send { to, latency_ms, message } => {
                    self.scheduler.schedule(self.now + latency_ms, Delivery { from: id, to, message });
                }
                NodeAction::Disconnect { peer } => {
                    if let Some(other) = self.nodes.get_mut(&peer) {
                        other.disconnect(id);
                    }
                    self.scheduler.cancel_between(id, peer);
                }
            }
        }
    }

    // ─── Housekeeping ────────────────────────────────────────────────

    fn housekeeping(&mut self) {
        let now = self.now;
        for id in self.node_ids() {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.expire_peers(now);
            }
            self.flush_actions(id);
        }

        if now.saturating_sub(self.last_rediscovery) >= self.config.rediscovery_interval_ms {
            self.last_rediscovery = now;
            for node in self.nodes.values_mut() {
                node.purge_histories(now);
            }
            self.rediscover();
        }

        if self.config.tx_interval_ms > 0 && now >= self.next_payment_at {
            let interval = self.config.tx_interval_ms;
            self.next_payment_at = now + self.rng.gen_range(interval / 2..=interval + interval / 2);
            self.random_payment();
        }
    }

    /// Nodes with free slots dial compatible candidates. The remote side
    /// may evict one of its neighbors to make room.
    pub fn rediscover(&mut self) -> usize {
        let now = self.now;
        let candidates: Vec<PeerCandidate> = self
            .nodes
            .values()
            .map(|n| PeerCandidate { id: n.id(), consensus: n.consensus().clone() })
            .collect();
        let mut linked = 0;

        for id in self.node_ids() {
            let wanted = match self.nodes.get(&id) {
                Some(node) => node.search_peers_to_connect(&candidates, &mut self.rng),
                None => continue,
            };
            for peer in wanted {
                let Some(consensus) = self.nodes.get(&id).map(|n| n.consensus().clone()) else { break };
                if self.nodes.get(&id).map_or(true, |n| n.peers().is_full()) {
                    break;
                }
                let latency = self.rng.gen_range(self.config.min_latency_ms..=self.config.max_latency_ms);
                let degrees: HashMap<NodeId, usize> = self.nodes.iter().map(|(i, n)| (*i, n.peer_count())).collect();
                let Some(remote) = self.nodes.get_mut(&peer) else { continue };
                let accepted = remote.accept_connection(
                    id,
                    &consensus,
                    latency,
                    now,
                    |n| degrees.get(&n).copied().unwrap_or(0),
                    &mut self.rng,
                );
                match accepted {
                    Ok(_) => {
                        let dialed = self.nodes.get_mut(&id).map_or(false, |n| n.connect_peer(peer, latency, now));
                        if dialed {
                            linked += 1;
                        } else if let Some(remote) = self.nodes.get_mut(&peer) {
                            remote.disconnect(id);
                        }
                    }
                    Err(reason) => tracing::debug!("Node {} refused {}: {}", peer, id, reason),
                }
                self.flush_actions(peer);
                self.flush_actions(id);
            }
        }
        if linked > 0 {
            tracing::debug!("🔗 Rediscovery opened {} links", linked);
        }
        linked
    }

    /// One wallet pays a tenth of its confirmed balance to another
    fn random_payment(&mut self) {
        let ids = self.node_ids();
        if ids.len() < 2 {
            return;
        }
        let from = ids[self.rng.gen_range(0..ids.len())];
        let to = loop {
            let candidate = ids[self.rng.gen_range(0..ids.len())];
            if candidate != from {
                break candidate;
            }
        };
        let Some(recipient) = self.wallets.get(&to).map(|w| w.address().to_string()) else { return };
        let Some(state) = self.nodes.get(&from).map(|n| n.balances()) else { return };
        let Some(wallet) = self.wallets.get_mut(&from) else { return };

        let amount = wallet.balance(&state) / 10;
        if amount <= PAYMENT_FEE {
            return;
        }
        let tx = match wallet.build_payment(&state, &recipient, amount, PAYMENT_FEE, self.now) {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!("Node {} skipped a payment: {}", from, e);
                return;
            }
        };
        let now = self.now;
        let Some(node) = self.nodes.get_mut(&from) else { return };
        match node.submit_transaction(tx, now) {
            Ok(()) => {
                self.stats.payments += 1;
                tracing::info!("💸 Node {} paid {} to node {}", from, format_amount(amount), to);
            }
            Err(reason) => tracing::debug!("Node {} payment rejected locally: {}", from, reason),
        }
        self.flush_actions(from);
    }

    // ─── Consensus ───────────────────────────────────────────────────

    /// Publish a version derived from `base` with new parameters from
    /// `from_height` on
    pub fn publish_consensus(
        &mut self,
        base: u32,
        from_height: u64,
        params: ConsensusParams,
    ) -> Result<Arc<ConsensusVersion>, SimError> {
        Ok(self.registry.publish_upgrade(base, from_height, params)?)
    }

    /// Move one node to a published version and drop links that became
    /// hard-incompatible
    pub fn upgrade_node(&mut self, id: NodeId, version: u32) -> Result<ForkKind, SimError> {
        let next = self.registry.get(version).ok_or(SimError::UnknownVersion(version))?;
        let node = self.nodes.get_mut(&id).ok_or(SimError::UnknownNode(id))?;
        let kind = node.change_consensus(next);
        let height = node.height().max(0) as u64;
        let consensus = node.consensus().clone();
        let peers = node.peers().ids();

        let incompatible: Vec<NodeId> = peers
            .into_iter()
            .filter(|peer| {
                self.nodes
                    .get(peer)
                    .map_or(false, |p| are_compatible(&consensus, p.consensus(), height) == ForkKind::Hard)
            })
            .collect();
        for peer in incompatible {
            tracing::info!("🚫 Node {} dropping peer {} after consensus change", id, peer);
            self.disconnect(id, peer);
        }
        self.flush_actions(id);
        Ok(kind)
    }

    pub fn upgrade_all(&mut self, version: u32) -> Result<(), SimError> {
        for id in self.node_ids() {
            self.upgrade_node(id, version)?;
        }
        Ok(())
    }

    // ─── Persistence ─────────────────────────────────────────────────

    fn links(&self) -> Vec<LinkRecord> {
        let mut links = Vec::new();
        for node in self.nodes.values() {
            for neighbor in node.peers().iter() {
                if node.id() < neighbor.node {
                    links.push(LinkRecord {
                        a: node.id(),
                        b: neighbor.node,
                        latency_ms: neighbor.latency_ms,
                        connected_at: neighbor.connected_at,
                    });
                }
            }
        }
        links
    }

    /// Store every node, the registry and the link table. In-flight
    /// deliveries are not saved.
    pub fn save(&self, storage: &Storage) -> Result<(), SimError> {
        storage.clear_all()?;
        storage.put_registry(&self.registry.to_records())?;
        for node in self.nodes.values() {
            storage.put_node(&node.to_snapshot())?;
        }
        let meta = NetworkMeta {
            version: SNAPSHOT_VERSION,
            now: self.now,
            config: self.config.clone(),
            links: self.links(),
        };
        storage.put_network(&meta)?;
        storage.flush()?;
        tracing::info!("💾 Saved {} nodes at t={}ms", self.nodes.len(), self.now);
        Ok(())
    }

    pub fn load(storage: &Storage) -> Result<Self, SimError> {
        let meta = storage.get_network()?;
        let registry = ConsensusRegistry::from_records(&storage.get_registry()?)?;
        let mut sim = Self::empty(meta.config, registry);
        sim.now = meta.now;
        sim.last_rediscovery = meta.now;
        sim.next_payment_at = meta.now + sim.config.tx_interval_ms;
        sim.rng = StdRng::seed_from_u64(sim.config.seed ^ meta.now);

        for snapshot in storage.load_nodes()? {
            let version = snapshot.consensus_version;
            let consensus = sim.registry.get(version).ok_or(SimError::UnknownVersion(version))?;
            let id = snapshot.id;
            let node = Node::restore(snapshot, consensus, sim.verifier.clone())?;
            sim.wallets.insert(id, Wallet::derive(&sim.deriver, id));
            sim.nodes.insert(id, node);
            sim.next_id = sim.next_id.max(id + 1);
        }
        for link in &meta.links {
            for (x, y) in [(link.a, link.b), (link.b, link.a)] {
                if let Some(node) = sim.nodes.get_mut(&x) {
                    node.connect_peer(y, link.latency_ms, link.connected_at);
                }
            }
        }
        for id in sim.node_ids() {
            sim.flush_actions(id);
        }
        tracing::info!("📂 Loaded {} nodes at t={}ms", sim.nodes.len(), sim.now);
        Ok(sim)
    }

    // ─── Reporting ───────────────────────────────────────────────────

    pub fn summary(&self) -> SimSummary {
        let nodes = self
            .nodes
            .values()
            .map(|n| NodeSummary {
                id: n.id(),
                height: n.height(),
                tip: short_hex(&n.tip_hash()),
                blocks: n.chain().len(),
                peers: n.peers().ids(),
                mempool: n.mempool().len(),
                orphans: n.orphans().len(),
                mining: n.is_mining(),
                consensus_version: n.consensus().version,
                balance: n.balance(n.mining_address()),
            })
            .collect();
        SimSummary { now: self.now, converged: self.converged(), stats: self.stats.clone(), nodes }
    }
}

impl std::fmt::Display for SimSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "t={:.1}s  converged={}  mined={}  discarded={}  delivered={}  payments={}  catch-ups={}/{}",
            self.now as f64 / 1000.0,
            self.converged,
            self.stats.blocks_mined,
            self.stats.blocks_discarded,
            self.stats.delivered,
            self.stats.payments,
            self.stats.catch_ups,
            self.stats.catch_ups + self.stats.failed_catch_ups,
        )?;
        for n in &self.nodes {
            writeln!(
                f,
                "  node {:>3}  #{:<5} {}  blocks={:<5} peers={:?}  mempool={}  v{}{}  balance={}",
                n.id,
                n.height,
                n.tip,
                n.blocks,
                n.peers,
                n.mempool,
                n.consensus_version,
                if n.mining { " ⛏️" } else { "" },
                format_amount(n.balance),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(nodes: usize) -> SimConfig {
        SimConfig {
            nodes,
            tick_ms: 100,
            hash_batch: 200,
            min_latency_ms: 20,
            max_latency_ms: 80,
            tx_interval_ms: 0,
            consensus: ConsensusParams::regtest(),
            ..SimConfig::default()
        }
    }

    #[test]
    fn test_initial_discovery_links_are_symmetric() {
        let sim = Simulation::new(small_config(5)).unwrap();
        assert!(sim.nodes().map(|n| n.peer_count()).sum::<usize>() > 0);
        for node in sim.nodes() {
            assert!(node.peer_count() <= MAX_PEER_SLOTS);
            for peer in node.peers().ids() {
                assert!(sim.node(peer).unwrap().peers().contains(node.id()), "links are symmetric");
            }
        }
    }

    #[test]
    fn test_same_seed_same_run() {
        let run = || {
            let mut sim = Simulation::new(small_config(4)).unwrap();
            sim.run_for(3_000);
            sim.nodes().map(|n| n.tip_hash()).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_network_converges_behind_one_miner() {
        let mut sim = Simulation::new(small_config(4)).unwrap();
        sim.run_for(5_000);
        assert!(sim.stats().blocks_mined > 0);

        // equal-height forks only resolve once someone extends one of them
        sim.stop_all_mining();
        sim.start_mining(0).unwrap();
        sim.run_for(2_000);
        sim.stop_mining(0).unwrap();
        assert!(sim.settle(60_000), "{}", sim.summary());
        for node in sim.nodes() {
            assert!(node.ledger().state().check_invariants());
        }
    }

    #[test]
    fn test_remove_node_cancels_deliveries() {
        let mut sim = Simulation::new(SimConfig { miners: Some(0), ..small_config(3) }).unwrap();
        sim.start_mining(0).unwrap();
        while sim.node(0).unwrap().height() < 0 {
            sim.tick();
        }
        let peers = sim.node(0).unwrap().peers().ids();
        sim.remove_node(peers[0]);
        assert!(sim.node(peers[0]).is_none());
        for node in sim.nodes() {
            assert!(!node.peers().contains(peers[0]));
        }
        sim.run_for(1_000);
        assert_eq!(sim.stats().dropped, 0, "nothing left addressed to the removed node");
    }

    #[test]
    fn test_payments_confirm() {
        let config = SimConfig { tx_interval_ms: 500, verifier: VerifierKind::Ed25519, ..small_config(3) };
        let mut sim = Simulation::new(config).unwrap();
        sim.run_for(20_000);
        assert!(sim.stats().payments > 0);
        sim.set_tx_interval(0);
        sim.stop_all_mining();
        sim.settle(60_000);
        let state = sim.node(0).unwrap().balances();
        assert!(state.check_invariants());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut sim = Simulation::new(small_config(3)).unwrap();
        sim.run_for(3_000);
        sim.save(&storage).unwrap();

        let loaded = Simulation::load(&storage).unwrap();
        assert_eq!(loaded.now(), sim.now());
        for node in sim.nodes() {
            let other = loaded.node(node.id()).unwrap();
            assert_eq!(other.tip_hash(), node.tip_hash());
            assert_eq!(other.is_mining(), node.is_mining());
            assert_eq!(other.peers().ids().len(), node.peers().ids().len());
        }
    }

    #[test]
    fn test_hard_upgrade_drops_incompatible_links() {
        let mut sim = Simulation::new(SimConfig { miners: Some(0), ..small_config(3) }).unwrap();
        let peers = sim.node(0).unwrap().peers().ids();
        assert!(!peers.is_empty());
        let hard = ConsensusParams { target_block_time: 99, ..ConsensusParams::regtest() };
        let v2 = sim.publish_consensus(1, 0, hard).unwrap();
        assert_eq!(sim.upgrade_node(0, v2.version).unwrap(), ForkKind::Hard);
        assert_eq!(sim.node(0).unwrap().peer_count(), 0);

        // rediscovery never links it back to old-rule nodes
        sim.rediscover();
        assert_eq!(sim.node(0).unwrap().peer_count(), 0);
        assert!(matches!(sim.upgrade_node(0, 9), Err(SimError::UnknownVersion(9))));
    }
}
