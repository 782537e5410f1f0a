//! Lock-free counters for the repair dispatch service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Running count / sum / max of a duration series, in microseconds.
#[derive(Debug, Default)]
pub struct DurationStat {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationStatSnapshot {
    pub count: u64,
    pub total_us: u64,
    pub max_us: u64,
}

impl DurationStatSnapshot {
    #[must_use]
    pub const fn mean_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_us / self.count
        }
    }
}

impl DurationStat {
    pub fn observe(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DurationStatSnapshot {
        DurationStatSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_us: self.total_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

/// Counters updated by the dispatch loop and its repair jobs.
#[derive(Debug, Default)]
pub struct RepairMetrics {
    selected: AtomicU64,
    repaired: AtomicU64,
    deleted: AtomicU64,
    retained: AtomicU64,
    irreparable_recorded: AtomicU64,
    irreparable_record_failures: AtomicU64,
    unexpected_errors: AtomicU64,
    delete_failures: AtomicU64,
    dispatch_errors: AtomicU64,
    empty_queue_bursts: AtomicU64,
    deadline_exceeded: AtomicU64,
    cancelled: AtomicU64,
    /// Job start to job end, successful jobs only.
    pub time_for_repair: DurationStat,
    /// Checker insertion to job end, successful jobs with a timestamp only.
    pub time_since_checker_queue: DurationStat,
}

/// Point-in-time copy of [`RepairMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairMetricsSnapshot {
    /// Segments claimed from the queue.
    pub selected: u64,
    /// Jobs whose repair call succeeded.
    pub repaired: u64,
    /// Queue entries removed.
    pub deleted: u64,
    /// Jobs that left their entry in the queue.
    pub retained: u64,
    pub irreparable_recorded: u64,
    pub irreparable_record_failures: u64,
    pub unexpected_errors: u64,
    pub delete_failures: u64,
    /// Admission or queue errors that stopped the dispatch loop.
    pub dispatch_errors: u64,
    pub empty_queue_bursts: u64,
    /// Jobs whose total timeout elapsed before they finished.
    pub deadline_exceeded: u64,
    /// Jobs cut short by shutdown or abort.
    pub cancelled: u64,
    pub time_for_repair: DurationStatSnapshot,
    pub time_since_checker_queue: DurationStatSnapshot,
}

impl RepairMetrics {
    pub fn record_selected(&self) {
        self.selected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repaired(&self) {
        self.repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retained(&self) {
        self.retained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_irreparable(&self) {
        self.irreparable_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_irreparable_failure(&self) {
        self.irreparable_record_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unexpected_error(&self) {
        self.unexpected_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_failure(&self) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_queue(&self) {
        self.empty_queue_bursts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadline_exceeded(&self) {
        self.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> RepairMetricsSnapshot {
        RepairMetricsSnapshot {
            selected: self.selected.load(Ordering::Relaxed),
            repaired: self.repaired.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            retained: self.retained.load(Ordering::Relaxed),
            irreparable_recorded: self.irreparable_recorded.load(Ordering::Relaxed),
            irreparable_record_failures: self.irreparable_record_failures.load(Ordering::Relaxed),
            unexpected_errors: self.unexpected_errors.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            empty_queue_bursts: self.empty_queue_bursts.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            time_for_repair: self.time_for_repair.snapshot(),
            time_since_checker_queue: self.time_since_checker_queue.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_stat_tracks_count_total_max() {
        let stat = DurationStat::default();
        stat.observe(Duration::from_micros(40));
        stat.observe(Duration::from_micros(100));
        stat.observe(Duration::from_micros(10));
        let snap = stat.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.total_us, 150);
        assert_eq!(snap.max_us, 100);
        assert_eq!(snap.mean_us(), 50);
    }

    #[test]
    fn empty_stat_has_zero_mean() {
        assert_eq!(DurationStatSnapshot::default().mean_us(), 0);
    }

    #[test]
    fn counters_are_independent() {
        let metrics = RepairMetrics::default();
        metrics.record_selected();
        metrics.record_selected();
        metrics.record_deleted();
        metrics.record_irreparable_failure();
        metrics.record_deadline_exceeded();
        metrics.time_for_repair.observe(Duration::from_millis(1));

        let snap = metrics.snapshot();
        assert_eq!(snap.selected, 2);
        assert_eq!(snap.deleted, 1);
        assert_eq!(snap.irreparable_record_failures, 1);
        assert_eq!(snap.repaired, 0);
        assert_eq!(snap.deadline_exceeded, 1);
        assert_eq!(snap.cancelled, 0);
        assert_eq!(snap.time_for_repair.count, 1);
        assert_eq!(snap.time_since_checker_queue.count, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = RepairMetrics::default();
        metrics.record_empty_queue();
        let json = serde_json::to_string(&metrics.snapshot()).expect("serialize");
        assert!(json.contains("\"empty_queue_bursts\":1"));
    }
}
