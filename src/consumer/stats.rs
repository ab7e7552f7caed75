//! Message accounting for a consumer.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::consumer::outcome::ConsumerStatus;

/// Monotone counters plus two gauges, updated by the dispatch loop.
///
/// Each delivered message contributes to exactly one of the terminal
/// counters; messages orphaned by a channel reset are excluded rather than
/// double-counted.
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    acknowledged: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
    /// Messages received from the broker but not yet handed to a handler.
    prefetched: AtomicU64,
    /// Queue depth observed at consume-start, snapshotted once per session.
    initial_message_count: AtomicU32,
}

impl StatsCounter {
    pub(crate) fn record(&self, status: ConsumerStatus) {
        let counter = match status {
            ConsumerStatus::Ack => &self.acknowledged,
            ConsumerStatus::Drop => &self.dropped,
            ConsumerStatus::Requeue => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn prefetched_inc(&self) {
        self.prefetched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn prefetched_dec(&self) {
        self.prefetched.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_prefetched(&self, value: u64) {
        self.prefetched.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_initial_message_count(&self, count: u32) {
        self.initial_message_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            prefetched: self.prefetched.load(Ordering::Relaxed),
            initial_message_count: self.initial_message_count.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of a consumer's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Messages acked after successful handling.
    pub acknowledged: u64,
    /// Messages nacked without requeue.
    pub dropped: u64,
    /// Messages nacked with requeue.
    pub requeued: u64,
    /// Messages currently buffered, waiting for a free handler slot.
    pub prefetched: u64,
    /// Queue depth at the start of the current session.
    pub initial_message_count: u32,
}
