//! Outbound scheduling: the bounded ack-retained queue, per-tick batch
//! assembly with coalescing, and the degraded-sync monitor.
//!
//! The queue is not drain-on-send. Entries leave only when the server's ack
//! watermark covers their `local_seq`, so a batch lost in flight is simply
//! retransmitted on a later tick; the server deduplicates by per-session
//! watermark. Coalescing happens at enqueue time: a queued mutation
//! superseded by a newer one for the same `(collection, entity)` is dropped,
//! which is safe under whole-record last-write-wins.

use std::collections::VecDeque;

use crate::protocol::Mutation;

// ───────────────────────────────────────────────────────────────────
// Outbound queue
// ───────────────────────────────────────────────────────────────────

/// Pending local mutations in `local_seq` order, retained until acked.
///
/// Target: enqueue with coalescing in <2µs at 10k capacity.
pub struct OutboundQueue {
    queue: VecDeque<Mutation>,
    max_size: usize,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Enqueue a pending mutation, dropping any queued predecessor for the
    /// same `(collection, entity)`. Returns false when the queue is full.
    pub fn push(&mut self, mutation: Mutation) -> bool {
        self.queue
            .retain(|m| !(m.collection == mutation.collection && m.entity == mutation.entity));
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(mutation);
        true
    }

    /// Clone up to `max` mutations for one outbound batch, oldest first.
    /// The queue itself is untouched; acks do the removing.
    pub fn peek_batch(&self, max: usize) -> Vec<Mutation> {
        self.queue.iter().take(max).cloned().collect()
    }

    /// Drop every mutation covered by the ack watermark. Returns how many
    /// left the queue.
    pub fn prune_acked(&mut self, ack_watermark: u64) -> usize {
        let before = self.queue.len();
        self.queue.retain(|m| m.local_seq > ack_watermark);
        before - self.queue.len()
    }

    /// Take everything, oldest first. Used when a fresh session must
    /// renumber pending work before requeueing it.
    pub fn drain(&mut self) -> Vec<Mutation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Total queued payload bytes, for stats reporting.
    pub fn payload_bytes(&self) -> usize {
        self.queue.iter().map(|m| m.payload.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Degraded-sync monitor
// ───────────────────────────────────────────────────────────────────

/// Notification from the flush monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSignal {
    /// The queue stayed non-empty for the configured number of consecutive
    /// ticks. Local mutation is not blocked; this is a banner, not a brake.
    Degraded { pending: usize },
    /// The queue drained after a degraded signal.
    Recovered,
}

/// Watches queue occupancy across scheduler ticks and raises one degraded
/// signal per episode.
pub struct FlushMonitor {
    threshold: u32,
    consecutive: u32,
    degraded: bool,
}

impl FlushMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
            degraded: false,
        }
    }

    /// Record one scheduler tick with the queue length observed at tick
    /// time. Ticks count whether or not the transport is up; a long outage
    /// with queued edits is exactly what the signal is for.
    pub fn on_tick(&mut self, queue_len: usize) -> Option<FlushSignal> {
        if queue_len == 0 {
            self.consecutive = 0;
            if self.degraded {
                self.degraded = false;
                return Some(FlushSignal::Recovered);
            }
            return None;
        }

        self.consecutive = self.consecutive.saturating_add(1);
        if !self.degraded && self.consecutive >= self.threshold {
            self.degraded = true;
            return Some(FlushSignal::Degraded { pending: queue_len });
        }
        None
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CollectionId, EntityId, OpKind, SessionId};

    fn mutation(collection: &str, entity: &str, local_seq: u64) -> Mutation {
        Mutation {
            collection: CollectionId::new(collection),
            op: OpKind::Upsert,
            entity: EntityId::new(entity),
            payload: vec![0xAB; 8],
            local_seq,
            origin: SessionId::generate(),
            server_seq: None,
        }
    }

    #[test]
    fn test_push_bounded() {
        let mut q = OutboundQueue::new(2);
        assert!(q.push(mutation("annotations", "a", 1)));
        assert!(q.push(mutation("annotations", "b", 2)));
        assert!(q.is_full());
        assert!(!q.push(mutation("annotations", "c", 3)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_push_coalesces_same_entity() {
        let mut q = OutboundQueue::new(16);
        q.push(mutation("annotations", "a", 1));
        q.push(mutation("annotations", "b", 2));
        q.push(mutation("annotations", "a", 3));

        let batch = q.peek_batch(16);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].local_seq, 2);
        assert_eq!(batch[1].local_seq, 3);
    }

    #[test]
    fn test_coalescing_respects_collection_boundaries() {
        let mut q = OutboundQueue::new(16);
        q.push(mutation("annotations", "a", 1));
        q.push(mutation("issues", "a", 2));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_coalescing_keeps_latest_op() {
        let mut q = OutboundQueue::new(16);
        q.push(mutation("annotations", "a", 1));
        let mut delete = mutation("annotations", "a", 2);
        delete.op = OpKind::Delete;
        delete.payload.clear();
        q.push(delete);

        let batch = q.peek_batch(16);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op, OpKind::Delete);
        assert_eq!(batch[0].local_seq, 2);
    }

    #[test]
    fn test_peek_batch_is_nondestructive_and_bounded() {
        let mut q = OutboundQueue::new(16);
        for seq in 1..=5 {
            q.push(mutation("annotations", &format!("e{seq}"), seq));
        }

        let batch = q.peek_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].local_seq, 1);
        assert_eq!(q.len(), 5);
        // Unacked work shows up again on the next tick.
        assert_eq!(q.peek_batch(3)[0].local_seq, 1);
    }

    #[test]
    fn test_prune_acked_respects_watermark() {
        let mut q = OutboundQueue::new(16);
        for seq in 1..=5 {
            q.push(mutation("annotations", &format!("e{seq}"), seq));
        }

        assert_eq!(q.prune_acked(3), 3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.peek_batch(16)[0].local_seq, 4);
        assert_eq!(q.prune_acked(3), 0);
    }

    #[test]
    fn test_drain_returns_in_order_and_empties() {
        let mut q = OutboundQueue::new(16);
        q.push(mutation("annotations", "a", 1));
        q.push(mutation("annotations", "b", 2));

        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].local_seq, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_payload_bytes_sums_queue() {
        let mut q = OutboundQueue::new(16);
        q.push(mutation("annotations", "a", 1));
        q.push(mutation("annotations", "b", 2));
        assert_eq!(q.payload_bytes(), 16);
    }

    #[test]
    fn test_monitor_fires_once_after_threshold() {
        let mut monitor = FlushMonitor::new(3);
        assert_eq!(monitor.on_tick(4), None);
        assert_eq!(monitor.on_tick(4), None);
        assert_eq!(monitor.on_tick(4), Some(FlushSignal::Degraded { pending: 4 }));
        // No repeat while the episode lasts.
        assert_eq!(monitor.on_tick(9), None);
        assert!(monitor.is_degraded());
    }

    #[test]
    fn test_monitor_empty_tick_resets_count() {
        let mut monitor = FlushMonitor::new(3);
        monitor.on_tick(1);
        monitor.on_tick(1);
        assert_eq!(monitor.on_tick(0), None);
        monitor.on_tick(1);
        monitor.on_tick(1);
        assert_eq!(monitor.on_tick(1), Some(FlushSignal::Degraded { pending: 1 }));
    }

    #[test]
    fn test_monitor_recovers_on_drain() {
        let mut monitor = FlushMonitor::new(2);
        monitor.on_tick(5);
        assert_eq!(monitor.on_tick(5), Some(FlushSignal::Degraded { pending: 5 }));
        assert_eq!(monitor.on_tick(0), Some(FlushSignal::Recovered));
        assert!(!monitor.is_degraded());
        // A clean drain with no degraded episode stays quiet.
        assert_eq!(monitor.on_tick(0), None);
    }
}
