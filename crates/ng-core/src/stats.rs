//! Router counters.
//!
//! Every counter is an atomic, so concurrent emits never lose updates.
//! Per-type counters live behind a read-mostly map: the write lock is only
//! taken the first time a type is seen.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::subscription::DispatchReport;

#[derive(Default)]
pub struct RouterStats {
    total_events: AtomicU64,
    /// Nanoseconds, so sub-microsecond fast-path times still accumulate.
    processing_ns: AtomicU64,
    fast_path_hits: AtomicU64,
    slow_path_events: AtomicU64,
    novel_tokens: AtomicU64,
    subscriber_notifications: AtomicU64,
    filter_matches: AtomicU64,
    filter_misses: AtomicU64,
    callback_errors: AtomicU64,
    dropped_events: AtomicU64,
    rejected_events: AtomicU64,
    by_type: RwLock<HashMap<String, AtomicU64>>,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_events: u64,
    pub avg_processing_time_us: f64,
    pub fast_path_hits: u64,
    pub fast_path_hit_rate: f64,
    pub slow_path_events: u64,
    pub novel_tokens: u64,
    pub subscriber_notifications: u64,
    pub filter_matches: u64,
    pub filter_misses: u64,
    pub callback_errors: u64,
    pub dropped_events: u64,
    pub rejected_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, event_type: &str, fast_path: bool, is_novel: bool, processing_ns: u64) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        self.processing_ns.fetch_add(processing_ns, Ordering::Relaxed);
        if fast_path {
            self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.slow_path_events.fetch_add(1, Ordering::Relaxed);
        }
        if is_novel {
            self.novel_tokens.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(counter) = self.by_type.read().get(event_type) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.by_type
            .write()
            .entry(event_type.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, report: &DispatchReport) {
        self.filter_matches.fetch_add(report.matched, Ordering::Relaxed);
        self.filter_misses.fetch_add(report.missed, Ordering::Relaxed);
        self.subscriber_notifications
            .fetch_add(report.notified, Ordering::Relaxed);
        self.callback_errors.fetch_add(report.failed, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_events = self.total_events.load(Ordering::Relaxed);
        let fast_path_hits = self.fast_path_hits.load(Ordering::Relaxed);
        let processing_ns = self.processing_ns.load(Ordering::Relaxed);
        let (avg_processing_time_us, fast_path_hit_rate) = if total_events == 0 {
            (0.0, 0.0)
        } else {
            (
                processing_ns as f64 / 1_000.0 / total_events as f64,
                fast_path_hits as f64 / total_events as f64,
            )
        };

        StatsSnapshot {
            total_events,
            avg_processing_time_us,
            fast_path_hits,
            fast_path_hit_rate,
            slow_path_events: self.slow_path_events.load(Ordering::Relaxed),
            novel_tokens: self.novel_tokens.load(Ordering::Relaxed),
            subscriber_notifications: self.subscriber_notifications.load(Ordering::Relaxed),
            filter_matches: self.filter_matches.load(Ordering::Relaxed),
            filter_misses: self.filter_misses.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            rejected_events: self.rejected_events.load(Ordering::Relaxed),
            events_by_type: self
                .by_type
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total_events,
            &self.processing_ns,
            &self.fast_path_hits,
            &self.slow_path_events,
            &self.novel_tokens,
            &self.subscriber_notifications,
            &self.filter_matches,
            &self.filter_misses,
            &self.callback_errors,
            &self.dropped_events,
            &self.rejected_events,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.by_type.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let snap = RouterStats::new().snapshot();
        assert_eq!(snap, StatsSnapshot::default());
    }

    #[test]
    fn test_record_event_paths() {
        let stats = RouterStats::new();
        stats.record_event("a.b", false, true, 4_000);
        stats.record_event("a.b", true, false, 1_000);
        stats.record_event("c", true, false, 1_000);
        let snap = stats.snapshot();
        assert_eq!(snap.total_events, 3);
        assert_eq!(snap.fast_path_hits, 2);
        assert_eq!(snap.slow_path_events, 1);
        assert_eq!(snap.novel_tokens, 1);
        assert_relative_eq!(snap.avg_processing_time_us, 2.0);
        assert_relative_eq!(snap.fast_path_hit_rate, 2.0 / 3.0);
        assert_eq!(snap.events_by_type["a.b"], 2);
        assert_eq!(snap.events_by_type["c"], 1);
    }

    #[test]
    fn test_record_dispatch_and_reset() {
        let stats = RouterStats::new();
        stats.record_dispatch(&DispatchReport {
            matched: 3,
            missed: 2,
            notified: 2,
            failed: 1,
        });
        stats.record_dropped();
        stats.record_rejected();
        stats.record_event("x", false, false, 10);
        let snap = stats.snapshot();
        assert_eq!(
            (snap.filter_matches, snap.filter_misses, snap.subscriber_notifications, snap.callback_errors),
            (3, 2, 2, 1)
        );
        assert_eq!((snap.dropped_events, snap.rejected_events), (1, 1));

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_no_lost_updates() {
        let stats = Arc::new(RouterStats::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let ty = format!("type.{}", (t + i) % 5);
                        stats.record_event(&ty, i % 2 == 0, false, 100);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.total_events, 8000);
        assert_eq!(snap.fast_path_hits + snap.slow_path_events, 8000);
        assert_eq!(snap.events_by_type.values().sum::<u64>(), 8000);
        assert_eq!(snap.events_by_type.len(), 5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RouterStats::new();
        stats.record_event("a", false, true, 1500);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["total_events"], 1);
        assert_eq!(json["events_by_type"]["a"], 1);
    }
}
