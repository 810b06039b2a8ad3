//! Node-local event stream for observers. Not consensus state.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

use crate::core::consensus::ForkKind;
use crate::core::types::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    BlockAccepted { hash: Hash256, height: i64, miner: NodeId, tip_changed: bool },
    BlockRejected { hash: Hash256, from: Option<NodeId>, reason: String },
    Reorg { depth: usize, new_tip: Hash256 },
    /// Retarget or halving attached to the block that triggered it
    Milestone { hash: Hash256, height: i64, note: String },
    TransactionAccepted { tx_id: Hash256 },
    PeerConnected { peer: NodeId, latency_ms: u64 },
    PeerDisconnected { peer: NodeId },
    MiningStarted,
    MiningStopped,
    ConsensusChanged { version: u32, kind: ForkKind, pruned: usize },
    SyncFailed { missing: Hash256 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub at: u64,
    pub event: NodeEvent,
}

/// Bounded in-memory history plus a broadcast feed
#[derive(Debug)]
pub struct EventLog {
    recent: VecDeque<TimedEvent>,
    capacity: usize,
    sender: broadcast::Sender<TimedEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { recent: VecDeque::with_capacity(capacity), capacity, sender }
    }

    pub fn push(&mut self, at: u64, event: NodeEvent) {
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        let entry = TimedEvent { at, event };
        // no subscribers is fine
        let _ = self.sender.send(entry.clone());
        self.recent.push_back(entry);
    }

    pub fn recent(&self) -> impl Iterator<Item = &TimedEvent> { self.recent.iter() }
    pub fn subscribe(&self) -> broadcast::Receiver<TimedEvent> { self.sender.subscribe() }
    pub fn len(&self) -> usize { self.recent.len() }
    pub fn is_empty(&self) -> bool { self.recent.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let mut log = EventLog::new(3);
        for peer in 0..5 {
            log.push(peer as u64, NodeEvent::PeerDisconnected { peer });
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.recent().next().map(|e| e.at), Some(2));
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let mut log = EventLog::new(8);
        let mut rx = log.subscribe();
        log.push(10, NodeEvent::MiningStarted);
        let got = rx.recv().await.unwrap();
        assert_eq!(got, TimedEvent { at: 10, event: NodeEvent::MiningStarted });
    }
}
