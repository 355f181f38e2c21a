//! Counters for the notification dispatch loop

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time view of the dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub events_received: u64,
    pub events_dispatched: u64,
    pub events_unmatched: u64,
    pub handler_panics: u64,
}

/// Thread-safe statistics collector, cheap to clone
#[derive(Clone, Default)]
pub struct StatsCollector {
    events_received: Arc<AtomicU64>,
    events_dispatched: Arc<AtomicU64>,
    events_unmatched: Arc<AtomicU64>,
    handler_panics: Arc<AtomicU64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_receive(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Message arrived for a pattern with no handler
    pub fn record_unmatched(&self) {
        self.events_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_unmatched: self.events_unmatched.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.events_received.store(0, Ordering::Relaxed);
        self.events_dispatched.store(0, Ordering::Relaxed);
        self.events_unmatched.store(0, Ordering::Relaxed);
        self.handler_panics.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_starts_empty() {
        let collector = StatsCollector::new();
        assert_eq!(collector.snapshot(), DispatchStats::default());
    }

    #[test]
    fn test_collector_counts() {
        let collector = StatsCollector::new();
        collector.record_receive();
        collector.record_receive();
        collector.record_dispatch();
        collector.record_unmatched();
        collector.record_panic();

        let stats = collector.snapshot();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.events_dispatched, 1);
        assert_eq!(stats.events_unmatched, 1);
        assert_eq!(stats.handler_panics, 1);
    }

    #[test]
    fn test_collector_clone_shares_counters() {
        let collector1 = StatsCollector::new();
        let collector2 = collector1.clone();
        collector1.record_receive();
        collector2.record_receive();

        assert_eq!(collector1.snapshot().events_received, 2);
    }

    #[test]
    fn test_collector_reset() {
        let collector = StatsCollector::new();
        collector.record_receive();
        collector.record_dispatch();
        collector.reset();
        assert_eq!(collector.snapshot(), DispatchStats::default());
    }

    #[test]
    fn test_stats_serialization() {
        let stats = DispatchStats {
            events_received: 10,
            events_dispatched: 8,
            events_unmatched: 1,
            handler_panics: 1,
        };

        let json = serde_json::to_string(&stats).unwrap();
        let deserialized: DispatchStats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, deserialized);
    }
}
