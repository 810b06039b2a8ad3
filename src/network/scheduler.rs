//! Deferred message delivery on the simulated clock.

use std::collections::BTreeMap;

use super::GossipMessage;
use crate::core::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: NodeId,
    pub to: NodeId,
    pub message: GossipMessage,
}

/// Identifies a scheduled delivery so it can be cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryHandle {
    at: u64,
    seq: u64,
}

impl DeliveryHandle {
    pub fn due_at(&self) -> u64 { self.at }
}

/// Pending deliveries ordered by due time, then by scheduling order
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<DeliveryHandle, Delivery>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self { Self::default() }

    pub fn schedule(&mut self, at: u64, delivery: Delivery) -> DeliveryHandle {
        let handle = DeliveryHandle { at, seq: self.next_seq };
        self.next_seq += 1;
        self.queue.insert(handle, delivery);
        handle
    }

    /// Cancel one delivery. Cancelling a delivered or unknown handle is a no-op.
    pub fn cancel(&mut self, handle: DeliveryHandle) -> Option<Delivery> {
        self.queue.remove(&handle)
    }

    /// Drop everything still addressed to `node`
    pub fn cancel_to(&mut self, node: NodeId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|_, d| d.to != node);
        before - self.queue.len()
    }

    /// Drop in-flight messages on the link between `a` and `b`, both directions
    pub fn cancel_between(&mut self, a: NodeId, b: NodeId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|_, d| !((d.from == a && d.to == b) || (d.from == b && d.to == a)));
        before - self.queue.len()
    }

    /// Remove and return every delivery due at or before `now`, in order
    pub fn pop_due(&mut self, now: u64) -> Vec<Delivery> {
        let split = DeliveryHandle { at: now.saturating_add(1), seq: 0 };
        let later = self.queue.split_off(&split);
        let due = std::mem::replace(&mut self.queue, later);
        due.into_values().collect()
    }

    pub fn next_due(&self) -> Option<u64> { self.queue.keys().next().map(|h| h.at) }
    pub fn len(&self) -> usize { self.queue.len() }
    pub fn is_empty(&self) -> bool { self.queue.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Block;

    fn msg(to: NodeId) -> Delivery {
        Delivery { from: 0, to, message: GossipMessage::Block(Block::origin()) }
    }

    #[test]
    fn test_pop_due_in_order() {
        let mut s = Scheduler::new();
        s.schedule(30, msg(3));
        s.schedule(10, msg(1));
        s.schedule(10, msg(2));
        assert_eq!(s.next_due(), Some(10));

        let due: Vec<NodeId> = s.pop_due(10).into_iter().map(|d| d.to).collect();
        assert_eq!(due, vec![1, 2]);
        assert!(s.pop_due(29).is_empty());
        assert_eq!(s.pop_due(100).len(), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut s = Scheduler::new();
        let h = s.schedule(5, msg(1));
        s.schedule(5, msg(2));
        s.schedule(6, msg(2));
        assert!(s.cancel(h).is_some());
        assert!(s.cancel(h).is_none(), "second cancel is a no-op");
        assert_eq!(s.cancel_to(2), 2);
        assert!(s.pop_due(10).is_empty());
    }

    #[test]
    fn test_cancel_between() {
        let mut s = Scheduler::new();
        s.schedule(5, Delivery { from: 1, to: 2, message: GossipMessage::Block(Block::origin()) });
        s.schedule(5, Delivery { from: 2, to: 1, message: GossipMessage::Block(Block::origin()) });
        s.schedule(5, Delivery { from: 3, to: 1, message: GossipMessage::Block(Block::origin()) });
        assert_eq!(s.cancel_between(1, 2), 2);
        assert_eq!(s.len(), 1);
    }
}
