//! Process Statistics
//!
//! Counters for ingest, indexing, query and retention activity. A single
//! `Stats` value is created at startup and injected into every component
//! that reports; there is no ambient global state. `snapshot()` feeds the
//! `GET /stats` endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct Stats {
    pub events_rx: AtomicU64,
    pub events_indexed: AtomicU64,
    pub batches_indexed: AtomicU64,
    pub batch_errors: AtomicU64,
    pub batch_timeouts: AtomicU64,
    pub queries_rx: AtomicU64,
    pub parse_failures: AtomicU64,
    pub tcp_events_rx: AtomicU64,
    pub udp_events_rx: AtomicU64,
    pub retention_runs: AtomicU64,
    pub retention_deletions: AtomicU64,
    pub cq_runs: AtomicU64,
    pub cq_errors: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub events_rx: u64,
    pub events_indexed: u64,
    pub batches_indexed: u64,
    pub batch_errors: u64,
    pub batch_timeouts: u64,
    pub queries_rx: u64,
    pub parse_failures: u64,
    pub tcp_events_rx: u64,
    pub udp_events_rx: u64,
    pub retention_runs: u64,
    pub retention_deletions: u64,
    pub cq_runs: u64,
    pub cq_errors: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            events_rx: get(&self.events_rx),
            events_indexed: get(&self.events_indexed),
            batches_indexed: get(&self.batches_indexed),
            batch_errors: get(&self.batch_errors),
            batch_timeouts: get(&self.batch_timeouts),
            queries_rx: get(&self.queries_rx),
            parse_failures: get(&self.parse_failures),
            tcp_events_rx: get(&self.tcp_events_rx),
            udp_events_rx: get(&self.udp_events_rx),
            retention_runs: get(&self.retention_runs),
            retention_deletions: get(&self.retention_deletions),
            cq_runs: get(&self.cq_runs),
            cq_errors: get(&self.cq_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = Stats::new();
        Stats::incr(&stats.events_rx);
        Stats::add(&stats.events_indexed, 5);

        let snap = stats.snapshot();
        assert_eq!(snap.events_rx, 1);
        assert_eq!(snap.events_indexed, 5);
        assert_eq!(snap.queries_rx, 0);
    }
}
