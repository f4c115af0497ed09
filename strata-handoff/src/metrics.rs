//! Handoff counters.
//!
//! One `HandoffMetrics` instance is shared by the service, its processors,
//! and their queues. Callers inject it (or let the service create one) and
//! read a consistent-enough view via [`HandoffMetrics::snapshot`]. Counters
//! are plain atomic adds; there is no global registry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide handoff counters, shared via `Arc`.
#[derive(Debug, Default)]
pub struct HandoffMetrics {
    write_req: AtomicU64,
    write_req_points: AtomicU64,
    deliveries: AtomicU64,
    delivery_points: AtomicU64,
    delivery_failures: AtomicU64,
    poison_dropped: AtomicU64,
    segments_evicted: AtomicU64,
    bytes_evicted: AtomicU64,
    queues_purged: AtomicU64,
}

impl HandoffMetrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr_write_req(&self, points: u64) {
        self.write_req.fetch_add(1, Ordering::Relaxed);
        self.write_req_points.fetch_add(points, Ordering::Relaxed);
    }

    pub(crate) fn incr_delivery(&self, points: u64) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        self.delivery_points.fetch_add(points, Ordering::Relaxed);
    }

    pub(crate) fn incr_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_poison_dropped(&self) {
        self.poison_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_evicted(&self, segments: u64, bytes: u64) {
        self.segments_evicted.fetch_add(segments, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn incr_queues_purged(&self) {
        self.queues_purged.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            write_req: self.write_req.load(Ordering::Relaxed),
            write_req_points: self.write_req_points.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_points: self.delivery_points.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            poison_dropped: self.poison_dropped.load(Ordering::Relaxed),
            segments_evicted: self.segments_evicted.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            queues_purged: self.queues_purged.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the handoff counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Foreground `write_shard` requests accepted by the service.
    pub write_req: u64,
    /// Points across all accepted `write_shard` requests.
    pub write_req_points: u64,
    /// Records successfully delivered by replay.
    pub deliveries: u64,
    /// Points across all delivered records.
    pub delivery_points: u64,
    /// Delivery attempts that failed (retryable or timed out).
    pub delivery_failures: u64,
    /// Records dropped as poison (undecodable or permanently rejected).
    pub poison_dropped: u64,
    /// Sealed segments evicted for disk budget.
    pub segments_evicted: u64,
    /// Bytes evicted for disk budget.
    pub bytes_evicted: u64,
    /// Whole queues purged for departed nodes.
    pub queues_purged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = HandoffMetrics::new();
        metrics.incr_write_req(10);
        metrics.incr_write_req(5);
        metrics.incr_delivery(10);
        metrics.incr_evicted(2, 4096);

        let snap = metrics.snapshot();
        assert_eq!(snap.write_req, 2);
        assert_eq!(snap.write_req_points, 15);
        assert_eq!(snap.deliveries, 1);
        assert_eq!(snap.delivery_points, 10);
        assert_eq!(snap.segments_evicted, 2);
        assert_eq!(snap.bytes_evicted, 4096);
    }
}
