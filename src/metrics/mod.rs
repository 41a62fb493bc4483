//! Metrics for monitoring resharding.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   ReshardingMetrics                      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Counters    │  │   Gauges     │  │  Histograms    │  │
//! │  │ - started    │  │ - active     │  │ - critical     │  │
//! │  │ - committed  │  │              │  │   section      │  │
//! │  │ - aborted    │  │              │  │ - operation    │  │
//! │  │ - retries    │  │              │  │   duration     │  │
//! │  └──────────────┘  └──────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, DURATION_BUCKETS};

use std::time::Duration;

/// Process-wide resharding metrics, shared by every coordinator instance.
#[derive(Debug)]
pub struct ReshardingMetrics {
    pub operations_started: Counter,
    pub operations_resumed: Counter,
    pub operations_committed: Counter,
    pub operations_aborted: Counter,
    pub aborts_by_kind: LabeledCounter,
    pub participant_retries: Counter,
    pub persist_conflicts: Counter,
    pub cleanup_retries: Counter,
    pub active_operations: Gauge,
    pub critical_section_duration: Histogram,
    pub operation_duration: Histogram,
}

impl Default for ReshardingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReshardingMetrics {
    pub fn new() -> Self {
        Self {
            operations_started: Counter::new(
                "resharding_operations_started_total",
                "Resharding operations created",
            ),
            operations_resumed: Counter::new(
                "resharding_operations_resumed_total",
                "Instances re-hydrated after leadership acquisition",
            ),
            operations_committed: Counter::new(
                "resharding_operations_committed_total",
                "Resharding operations that reached done",
            ),
            operations_aborted: Counter::new(
                "resharding_operations_aborted_total",
                "Resharding operations that reached done-aborted",
            ),
            aborts_by_kind: LabeledCounter::new("resharding_aborts_total", "kind"),
            participant_retries: Counter::new(
                "resharding_participant_retries_total",
                "Participant command attempts that were retried",
            ),
            persist_conflicts: Counter::new(
                "resharding_persist_conflicts_total",
                "Compare-and-swap persists that lost to another writer",
            ),
            cleanup_retries: Counter::new(
                "resharding_cleanup_retries_total",
                "Background cleanup attempts",
            ),
            active_operations: Gauge::new(
                "resharding_active_operations",
                "Coordinator instances currently running",
            ),
            critical_section_duration: Histogram::new(
                "resharding_critical_section_seconds",
                "Time donor writes were blocked",
            ),
            operation_duration: Histogram::new(
                "resharding_operation_seconds",
                "Wall time from start to terminal phase",
            ),
        }
    }

    /// Record that an instance reached a terminal phase.
    pub fn record_finished(&self, committed: bool, elapsed: Duration) {
        if committed {
            self.operations_committed.inc();
        } else {
            self.operations_aborted.inc();
        }
        self.operation_duration.observe(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_started: self.operations_started.get(),
            operations_resumed: self.operations_resumed.get(),
            operations_committed: self.operations_committed.get(),
            operations_aborted: self.operations_aborted.get(),
            aborts_by_kind: self.aborts_by_kind.get_all(),
            participant_retries: self.participant_retries.get(),
            persist_conflicts: self.persist_conflicts.get(),
            cleanup_retries: self.cleanup_retries.get(),
            active_operations: self.active_operations.get(),
            critical_section: self.critical_section_duration.snapshot(),
            operation: self.operation_duration.snapshot(),
        }
    }
}

/// Point-in-time copy of all resharding metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub operations_started: u64,
    pub operations_resumed: u64,
    pub operations_committed: u64,
    pub operations_aborted: u64,
    pub aborts_by_kind: Vec<(String, u64)>,
    pub participant_retries: u64,
    pub persist_conflicts: u64,
    pub cleanup_retries: u64,
    pub active_operations: i64,
    pub critical_section: HistogramSnapshot,
    pub operation: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = ReshardingMetrics::new();
        metrics.operations_started.inc();
        metrics.active_operations.inc();
        metrics.aborts_by_kind.inc("user-abort");
        metrics.record_finished(false, Duration::from_millis(30));
        metrics.active_operations.dec();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_started, 1);
        assert_eq!(snapshot.operations_aborted, 1);
        assert_eq!(snapshot.operations_committed, 0);
        assert_eq!(snapshot.active_operations, 0);
        assert_eq!(snapshot.aborts_by_kind, vec![("user-abort".to_string(), 1)]);
        assert_eq!(snapshot.operation.count, 1);
    }
}
