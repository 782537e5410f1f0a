//! In-memory [`IrreparableStore`] keyed by segment path.
//!
//! A write for a path that is already recorded merges into the existing
//! record: attempt counts add up, and the newest attempt time, lost piece
//! count, and segment detail replace the old ones.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{Cx, IrreparableSegment, IrreparableStore, RepairError, RepairResult, SegmentPath};
use serde::{Deserialize, Serialize};

const SUBSYSTEM: &str = "irreparable_store";

#[derive(Debug)]
struct StoreUnavailable;

impl fmt::Display for StoreUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("irreparable store unavailable (injected)")
    }
}

impl std::error::Error for StoreUnavailable {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    Inserted,
    Merged,
}

#[derive(Debug, Default)]
pub struct IrreparableMetrics {
    pub total_inserted: AtomicU64,
    pub total_merged: AtomicU64,
    pub total_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrreparableMetricsSnapshot {
    pub total_inserted: u64,
    pub total_merged: u64,
    pub total_failures: u64,
}

impl IrreparableMetrics {
    #[must_use]
    pub fn snapshot(&self) -> IrreparableMetricsSnapshot {
        IrreparableMetricsSnapshot {
            total_inserted: self.total_inserted.load(Ordering::Relaxed),
            total_merged: self.total_merged.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

/// In-process irreparable segment store keyed by path.
///
/// A submitted record for a new path is stored as-is. For a known path the
/// attempt counts are added and the last-attempt time, lost pieces, and
/// segment detail are replaced by the submitted values.
#[derive(Debug, Default)]
pub struct MemoryIrreparableStore {
    records: Mutex<BTreeMap<SegmentPath, IrreparableSegment>>,
    metrics: IrreparableMetrics,
    fail_writes: AtomicBool,
}

impl MemoryIrreparableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn metrics(&self) -> &IrreparableMetrics {
        &self.metrics
    }

    /// Make every subsequent write fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    #[must_use]
    pub fn get(&self, path: &SegmentPath) -> Option<IrreparableSegment> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// All records ordered by path.
    #[must_use]
    pub fn list(&self) -> Vec<IrreparableSegment> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove a record. Returns whether one existed.
    pub fn delete(&self, path: &SegmentPath) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn merge(&self, segment: &IrreparableSegment) -> RepairResult<MergeOutcome> {
        let mut records = self.records.lock().map_err(lock_error)?;
        let outcome = match records.get_mut(&segment.path) {
            Some(existing) => {
                existing.repair_attempt_count = existing
                    .repair_attempt_count
                    .saturating_add(segment.repair_attempt_count);
                existing.last_repair_attempt = segment.last_repair_attempt;
                existing.lost_pieces = segment.lost_pieces;
                existing.segment_detail.clone_from(&segment.segment_detail);
                MergeOutcome::Merged
            }
            None => {
                records.insert(segment.path.clone(), segment.clone());
                MergeOutcome::Inserted
            }
        };
        Ok(outcome)
    }
}

impl IrreparableStore for MemoryIrreparableStore {
    fn increment_repair_attempts(&self, _cx: &Cx, segment: &IrreparableSegment) -> RepairResult<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            self.metrics.total_failures.fetch_add(1, Ordering::Relaxed);
            return Err(RepairError::IrreparableStore {
                path: segment.path.to_string(),
                source: Box::new(StoreUnavailable),
            });
        }
        let outcome = self.merge(segment)?;
        match outcome {
            MergeOutcome::Inserted => self.metrics.total_inserted.fetch_add(1, Ordering::Relaxed),
            MergeOutcome::Merged => self.metrics.total_merged.fetch_add(1, Ordering::Relaxed),
        };
        tracing::debug!(
            target: targets::IRREPARABLE,
            path = %segment.path,
            lost_pieces = segment.lost_pieces,
            ?outcome,
            "irreparable segment recorded"
        );
        Ok(())
    }
}

fn lock_error<T>(_: PoisonError<T>) -> RepairError {
    RepairError::subsystem(SUBSYSTEM, std::io::Error::other("irreparable store lock poisoned"))
}
