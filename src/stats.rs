//! Per-worker atomic counters, drained periodically by a logging task.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic statistics for one worker's share of traffic. Counters are
/// per-worker (never shared across threads) and aggregated only by
/// summing snapshots, so no cross-thread synchronization is needed here.
pub struct Stats {
    pub queries_received: AtomicU64,
    pub answers_forwarded: AtomicU64,
    pub timed_out: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub udp_truncated: AtomicU64,
    /// Cumulative round-trip time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            queries_received: AtomicU64::new(0),
            answers_forwarded: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            udp_truncated: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self) {
        self.queries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, response_time_ms: f64) {
        self.answers_forwarded.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_dropped(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_truncated(&self) {
        self.udp_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let received = self.queries_received.swap(0, Ordering::Relaxed);
        let forwarded = self.answers_forwarded.swap(0, Ordering::Relaxed);
        let timed_out = self.timed_out.swap(0, Ordering::Relaxed);
        let malformed_dropped = self.malformed_dropped.swap(0, Ordering::Relaxed);
        let udp_truncated = self.udp_truncated.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if forwarded > 0 {
            (total_us as f64 / forwarded as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            received,
            forwarded,
            timed_out,
            malformed_dropped,
            udp_truncated,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub timed_out: u64,
    pub malformed_dropped: u64,
    pub udp_truncated: u64,
    pub avg_response_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_counters_and_averages_forwarded_latency() {
        let stats = Stats::new();
        stats.record_received();
        stats.record_received();
        stats.record_forwarded(10.0);
        stats.record_forwarded(20.0);
        stats.record_timed_out();

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.forwarded, 2);
        assert_eq!(snapshot.timed_out, 1);
        assert!((snapshot.avg_response_ms - 15.0).abs() < 1e-6);

        let empty = stats.snapshot_and_reset();
        assert_eq!(empty.received, 0);
        assert_eq!(empty.avg_response_ms, 0.0);
    }
}
