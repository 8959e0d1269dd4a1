//! Monotonic pipeline counters.
//!
//! Plain relaxed increments on the hot path, read only for the periodic
//! status lines and shutdown summaries.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one edge process.
#[derive(Debug, Default)]
pub struct EdgeCounters {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub accepted: AtomicU64,
    pub parse_errors: AtomicU64,
    pub validation_errors: AtomicU64,
    pub queue_errors: AtomicU64,
    pub broadcasts_delivered: AtomicU64,
    pub broadcasts_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeSnapshot {
    pub open_connections: u64,
    pub accepted: u64,
    pub parse_errors: u64,
    pub validation_errors: u64,
    pub queue_errors: u64,
    pub broadcasts_delivered: u64,
    pub broadcasts_failed: u64,
}

impl EdgeCounters {
    pub fn snapshot(&self) -> EdgeSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        EdgeSnapshot {
            open_connections: opened.saturating_sub(closed),
            accepted: self.accepted.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
            broadcasts_delivered: self.broadcasts_delivered.load(Ordering::Relaxed),
            broadcasts_failed: self.broadcasts_failed.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one consumer process, shared by all room workers.
#[derive(Debug, Default)]
pub struct ConsumerCounters {
    pub processed: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub bus_queued: AtomicU64,
    pub bus_published: AtomicU64,
    pub db_queued: AtomicU64,
    pub db_dropped: AtomicU64,
    pub db_written: AtomicU64,
    pub db_batches_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSnapshot {
    pub processed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub bus_queued: u64,
    pub bus_published: u64,
    pub db_queued: u64,
    pub db_dropped: u64,
    pub db_written: u64,
    pub db_batches_failed: u64,
}

impl ConsumerCounters {
    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            bus_queued: self.bus_queued.load(Ordering::Relaxed),
            bus_published: self.bus_published.load(Ordering::Relaxed),
            db_queued: self.db_queued.load(Ordering::Relaxed),
            db_dropped: self.db_dropped.load(Ordering::Relaxed),
            db_written: self.db_written.load(Ordering::Relaxed),
            db_batches_failed: self.db_batches_failed.load(Ordering::Relaxed),
        }
    }
}

/// Load-client counters plus a minimal latency aggregate.
#[derive(Debug, Default)]
pub struct ClientCounters {
    pub sent: AtomicU64,
    pub acked: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub generator_drops: AtomicU64,
    latency_count: AtomicU64,
    latency_sum_micros: AtomicU64,
    latency_max_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientSnapshot {
    pub sent: u64,
    pub acked: u64,
    pub failed: u64,
    pub retries: u64,
    pub breaker_rejections: u64,
    pub generator_drops: u64,
    pub latency_avg_micros: u64,
    pub latency_max_micros: u64,
}

impl ClientCounters {
    pub fn record_latency(&self, micros: u64) {
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.latency_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let sum = self.latency_sum_micros.load(Ordering::Relaxed);
        ClientSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            generator_drops: self.generator_drops.load(Ordering::Relaxed),
            latency_avg_micros: if count == 0 { 0 } else { sum / count },
            latency_max_micros: self.latency_max_micros.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_snapshot_tracks_open_connections() {
        let c = EdgeCounters::default();
        c.connections_opened.fetch_add(3, Ordering::Relaxed);
        c.connections_closed.fetch_add(1, Ordering::Relaxed);
        c.accepted.fetch_add(10, Ordering::Relaxed);
        let s = c.snapshot();
        assert_eq!(s.open_connections, 2);
        assert_eq!(s.accepted, 10);
    }

    #[test]
    fn latency_aggregate() {
        let c = ClientCounters::default();
        c.record_latency(100);
        c.record_latency(300);
        let s = c.snapshot();
        assert_eq!(s.latency_avg_micros, 200);
        assert_eq!(s.latency_max_micros, 300);
    }
}
