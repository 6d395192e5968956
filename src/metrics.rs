//! # Engine Metrics
//!
//! Best-effort counters and gauges kept in process-local atomics and exposed
//! through the health endpoint. The backlog gauges are refreshed after each
//! poll tick; no cross-worker consistency is promised.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_compensated: AtomicU64,
    attempts_observed: AtomicU64,
    attempt_duration_total_ms: AtomicU64,
    outbox_backlog: AtomicI64,
    /// Seconds; -1 when no PENDING message exists.
    outbox_oldest_pending_age_seconds: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_compensated: u64,
    pub attempts_observed: u64,
    pub attempt_avg_duration_ms: u64,
    pub outbox_backlog: i64,
    pub outbox_oldest_pending_age_seconds: Option<i64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_compensated(&self) {
        self.runs_compensated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_attempt(&self, duration_ms: u64) {
        self.attempts_observed.fetch_add(1, Ordering::Relaxed);
        self.attempt_duration_total_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn set_outbox_gauges(&self, backlog: i64, oldest_pending_age_seconds: Option<i64>) {
        self.outbox_backlog.store(backlog, Ordering::Relaxed);
        self.outbox_oldest_pending_age_seconds
            .store(oldest_pending_age_seconds.unwrap_or(-1), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let attempts = self.attempts_observed.load(Ordering::Relaxed);
        let total_ms = self.attempt_duration_total_ms.load(Ordering::Relaxed);
        let age = self.outbox_oldest_pending_age_seconds.load(Ordering::Relaxed);

        MetricsSnapshot {
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_compensated: self.runs_compensated.load(Ordering::Relaxed),
            attempts_observed: attempts,
            attempt_avg_duration_ms: if attempts == 0 { 0 } else { total_ms / attempts },
            outbox_backlog: self.outbox_backlog.load(Ordering::Relaxed),
            outbox_oldest_pending_age_seconds: if age < 0 { None } else { Some(age) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_run_completed();
        metrics.record_run_completed();
        metrics.record_run_failed();
        metrics.record_run_compensated();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_completed, 2);
        assert_eq!(snapshot.runs_failed, 1);
        assert_eq!(snapshot.runs_compensated, 1);
    }

    #[test]
    fn attempt_latency_averages() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.snapshot().attempt_avg_duration_ms, 0);

        metrics.observe_attempt(100);
        metrics.observe_attempt(300);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempts_observed, 2);
        assert_eq!(snapshot.attempt_avg_duration_ms, 200);
    }

    #[test]
    fn empty_backlog_has_no_age() {
        let metrics = EngineMetrics::new();
        metrics.set_outbox_gauges(0, None);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.outbox_backlog, 0);
        assert_eq!(snapshot.outbox_oldest_pending_age_seconds, None);

        metrics.set_outbox_gauges(4, Some(17));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.outbox_backlog, 4);
        assert_eq!(snapshot.outbox_oldest_pending_age_seconds, Some(17));
    }
}
