//! In-memory [`RepairQueue`] for tests, local runs, and embedders without a
//! durable backend.
//!
//! Selection prefers segments that were never attempted, in insertion order.
//! Once every pending segment has been attempted, the oldest attempt older
//! than [`RepairQueueConfig::reattempt_after`] is handed out again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{
    Cx, InjuredSegment, RepairError, RepairQueue, RepairResult, SegmentPath, checkpoint,
    sleep_blocking,
};
use serde::{Deserialize, Serialize};

const SUBSYSTEM: &str = "repair_queue";

/// Attempted items become selectable again after this long.
pub const DEFAULT_REATTEMPT_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairQueueConfig {
    pub reattempt_after: Duration,
    /// Artificial latency inside `select`, after the context check.
    pub select_delay: Duration,
}

impl Default for RepairQueueConfig {
    fn default() -> Self {
        Self {
            reattempt_after: DEFAULT_REATTEMPT_AFTER,
            select_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub total_inserted: AtomicU64,
    pub total_deduplicated: AtomicU64,
    pub total_selected: AtomicU64,
    pub total_empty_selects: AtomicU64,
    pub total_deleted: AtomicU64,
    pub total_delete_misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub total_inserted: u64,
    pub total_deduplicated: u64,
    pub total_selected: u64,
    pub total_empty_selects: u64,
    pub total_deleted: u64,
    pub total_delete_misses: u64,
}

impl QueueMetrics {
    #[must_use]
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            total_inserted: self.total_inserted.load(Ordering::Relaxed),
            total_deduplicated: self.total_deduplicated.load(Ordering::Relaxed),
            total_selected: self.total_selected.load(Ordering::Relaxed),
            total_empty_selects: self.total_empty_selects.load(Ordering::Relaxed),
            total_deleted: self.total_deleted.load(Ordering::Relaxed),
            total_delete_misses: self.total_delete_misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct InjectedFailure {
    op: &'static str,
}

impl fmt::Display for InjectedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "injected {} failure", self.op)
    }
}

impl std::error::Error for InjectedFailure {}

#[derive(Debug)]
struct QueueEntry {
    segment: InjuredSegment,
    seq: u64,
    attempted_at: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<SegmentPath, QueueEntry>,
    next_seq: u64,
}

/// In-process repair queue.
///
/// Selection order: never-attempted items first, in insertion order; then
/// the item with the oldest attempt, provided that attempt is at least
/// `reattempt_after` old. Selecting stamps `attempted_at`, so an item is not
/// handed out twice within the reattempt window.
#[derive(Debug, Default)]
pub struct MemoryRepairQueue {
    config: RepairQueueConfig,
    state: Mutex<QueueState>,
    metrics: QueueMetrics,
    fail_selects: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryRepairQueue {
    #[must_use]
    pub fn new(config: RepairQueueConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RepairQueueConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Queue a segment. Returns `false` if the path is already queued.
    pub fn insert(&self, segment: InjuredSegment) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.contains_key(&segment.path) {
            self.metrics
                .total_deduplicated
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(target: targets::QUEUE, path = %segment.path, "duplicate insert ignored");
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            segment.path.clone(),
            QueueEntry {
                segment,
                seq,
                attempted_at: None,
            },
        );
        self.metrics.total_inserted.fetch_add(1, Ordering::Relaxed);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, path: &SegmentPath) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(path)
    }

    /// Number of queued items that have been selected at least once.
    #[must_use]
    pub fn count_attempted(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .values()
            .filter(|entry| entry.attempted_at.is_some())
            .count()
    }

    /// Make every subsequent `select` fail with a queue error until reset.
    pub fn fail_selects(&self, fail: bool) {
        self.fail_selects.store(fail, Ordering::Release);
    }

    /// Make every subsequent `delete` fail with a queue error until reset.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Release);
    }

    fn pick(&self, state: &QueueState, now: SystemTime) -> Option<SegmentPath> {
        let fresh = state
            .entries
            .values()
            .filter(|entry| entry.attempted_at.is_none())
            .min_by_key(|entry| entry.seq);
        if let Some(entry) = fresh {
            return Some(entry.segment.path.clone());
        }
        state
            .entries
            .values()
            .filter_map(|entry| entry.attempted_at.map(|at| (at, entry)))
            .filter(|(at, _)| {
                now.duration_since(*at)
                    .is_ok_and(|age| age >= self.config.reattempt_after)
            })
            .min_by_key(|(at, entry)| (*at, entry.seq))
            .map(|(_, entry)| entry.segment.path.clone())
    }
}

impl RepairQueue for MemoryRepairQueue {
    fn select(&self, cx: &Cx) -> RepairResult<InjuredSegment> {
        checkpoint(cx, "select")?;
        if self.fail_selects.load(Ordering::Acquire) {
            return Err(RepairError::queue("select", InjectedFailure { op: "select" }));
        }
        if !self.config.select_delay.is_zero() {
            sleep_blocking(cx, "select", self.config.select_delay)?;
        }

        let mut state = self.state.lock().map_err(lock_error)?;
        let now = SystemTime::now();
        let Some(path) = self.pick(&state, now) else {
            self.metrics
                .total_empty_selects
                .fetch_add(1, Ordering::Relaxed);
            return Err(RepairError::EmptyQueue);
        };
        let entry = state
            .entries
            .get_mut(&path)
            .ok_or(RepairError::EmptyQueue)?;
        let retry = entry.attempted_at.is_some();
        entry.attempted_at = Some(now);
        let segment = entry.segment.clone();
        drop(state);

        self.metrics.total_selected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: targets::QUEUE, path = %segment.path, retry, "segment selected");
        Ok(segment)
    }

    fn delete(&self, cx: &Cx, segment: &InjuredSegment) -> RepairResult<()> {
        checkpoint(cx, "delete")?;
        if self.fail_deletes.load(Ordering::Acquire) {
            return Err(RepairError::queue("delete", InjectedFailure { op: "delete" }));
        }
        let removed = self
            .state
            .lock()
            .map_err(lock_error)?
            .entries
            .remove(&segment.path)
            .is_some();
        if removed {
            self.metrics.total_deleted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics
                .total_delete_misses
                .fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(target: targets::QUEUE, path = %segment.path, removed, "segment deleted");
        Ok(())
    }
}

fn lock_error<T>(_: PoisonError<T>) -> RepairError {
    RepairError::subsystem(SUBSYSTEM, std::io::Error::other("repair queue lock poisoned"))
}
