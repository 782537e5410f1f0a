//! One repair job: run the repairer, classify the outcome, update the stores.
//!
//! A [`RepairJob`] owns the admission permit and its job scope for its whole
//! life. Dropping the job cancels the job context before the permit returns
//! its unit.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{
    CancelReason, Cx, InjuredSegment, IrreparableDetail, IrreparableSegment, IrreparableStore,
    RepairAttempt, RepairError, RepairFailure, RepairMetrics, RepairQueue, SegmentPath,
    SegmentRepairer,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::inflight::JobScope;
use crate::limiter::JobPermit;

/// Final disposition of one job, from the queue's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Repair succeeded and the entry was removed.
    Repaired,
    /// The repairer asked to keep the entry.
    Retained,
    /// Recorded in the irreparable store and removed from the queue.
    IrreparableRecorded,
    /// Irreparable, but the record write failed; the entry stays queued.
    IrreparableLeftPending,
    /// Unexpected failure; the repairer still asked for removal.
    FailedDeleted,
    /// Unexpected failure; the entry stays queued.
    FailedLeftPending,
    /// Removal was due but the queue rejected it.
    DeleteFailed,
}

impl JobOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Repaired => "repaired",
            Self::Retained => "retained",
            Self::IrreparableRecorded => "irreparable_recorded",
            Self::IrreparableLeftPending => "irreparable_left_pending",
            Self::FailedDeleted => "failed_deleted",
            Self::FailedLeftPending => "failed_left_pending",
            Self::DeleteFailed => "delete_failed",
        }
    }

    /// Whether the queue entry was removed.
    #[must_use]
    pub const fn deleted(self) -> bool {
        matches!(
            self,
            Self::Repaired | Self::IrreparableRecorded | Self::FailedDeleted
        )
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished job did, plus the job-level error if there was one.
#[derive(Debug)]
pub struct JobReport {
    pub path: SegmentPath,
    pub outcome: JobOutcome,
    /// Always [`RepairError::Job`] when present.
    pub error: Option<RepairError>,
    /// Set when the job context was cancelled from outside the job: deadline,
    /// service shutdown, or abort.
    pub cancel_cause: Option<CancelReason>,
}

/// Collaborators shared by every job a service spawns.
pub(crate) struct JobDeps {
    pub(crate) queue: Arc<dyn RepairQueue>,
    pub(crate) store: Arc<dyn IrreparableStore>,
    pub(crate) repairer: Arc<dyn SegmentRepairer>,
    pub(crate) metrics: Arc<RepairMetrics>,
}

pub(crate) struct RepairJob {
    scope: Arc<JobScope>,
    segment: InjuredSegment,
    deps: Arc<JobDeps>,
    _permit: JobPermit,
}

impl Drop for RepairJob {
    fn drop(&mut self) {
        // Runs before the fields drop, so before the permit is released.
        self.scope.cx().set_cancel_requested(true);
    }
}

impl RepairJob {
    pub(crate) fn new(
        scope: Arc<JobScope>,
        segment: InjuredSegment,
        deps: Arc<JobDeps>,
        permit: JobPermit,
    ) -> Self {
        Self {
            scope,
            segment,
            deps,
            _permit: permit,
        }
    }

    /// Execute the job. The context is cancelled and the permit released when
    /// `self` drops at the end of this call, on every path.
    pub(crate) fn run(self) -> JobReport {
        let span = tracing::info_span!(
            target: targets::JOB,
            "frankenrepair::repair_job",
            path = %self.segment.path,
        );
        let mut report = span.in_scope(|| self.execute());
        report.cancel_cause = self.scope.cause();
        match report.cancel_cause {
            Some(CancelReason::Timeout) => {
                self.deps.metrics.record_deadline_exceeded();
                warn!(
                    target: targets::JOB,
                    path = %report.path,
                    outcome = %report.outcome,
                    "repair job ran past its total timeout"
                );
            }
            Some(reason) => {
                self.deps.metrics.record_cancelled();
                debug!(
                    target: targets::JOB,
                    path = %report.path,
                    reason = %reason,
                    "repair job cancelled"
                );
            }
            None => {}
        }
        match &report.error {
            Some(err) => error!(
                target: targets::JOB,
                path = %report.path,
                outcome = %report.outcome,
                error = %err,
                "repair worker failed"
            ),
            None => debug!(
                target: targets::JOB,
                path = %report.path,
                outcome = %report.outcome,
                "repair job finished"
            ),
        }
        report
    }

    fn execute(&self) -> JobReport {
        let cx = self.scope.cx();
        let path = &self.segment.path;
        let metrics = &self.deps.metrics;
        let started = Instant::now();
        let started_wall = SystemTime::now();

        debug!(
            target: targets::JOB,
            path = %path,
            budget_ms = self.scope.deadline().map(|deadline| {
                u64::try_from(deadline.saturating_duration_since(started).as_millis())
                    .unwrap_or(u64::MAX)
            }),
            "running repair on segment"
        );
        let RepairAttempt {
            mut should_delete,
            result,
        } = self.deps.repairer.repair(cx, path);

        let mut outcome = if should_delete {
            JobOutcome::Repaired
        } else {
            JobOutcome::Retained
        };

        let repair_succeeded = result.is_ok();
        let mut err = match result {
            Ok(()) => None,
            Err(RepairFailure::Irreparable(detail)) => {
                let failure = RepairError::Irreparable {
                    path: path.to_string(),
                    pieces_required: detail.pieces_required,
                    pieces_available: detail.pieces_available,
                };
                if should_delete {
                    outcome = self.record_irreparable(cx, detail, &mut should_delete, &failure);
                } else {
                    outcome = JobOutcome::FailedLeftPending;
                }
                Some(failure)
            }
            Err(other) => {
                let failure = other.into_error(path);
                if should_delete {
                    metrics.record_unexpected_error();
                    error!(
                        target: targets::JOB,
                        path = %path,
                        error = %failure,
                        "unexpected error repairing segment"
                    );
                    outcome = JobOutcome::FailedDeleted;
                } else {
                    outcome = JobOutcome::FailedLeftPending;
                }
                Some(failure)
            }
        };

        if should_delete {
            match self.deps.queue.delete(cx, &self.segment) {
                Ok(()) => {
                    metrics.record_deleted();
                    if repair_succeeded {
                        metrics.record_repaired();
                    }
                    debug!(target: targets::JOB, path = %path, "removed segment from repair queue");
                }
                Err(del_err) => {
                    metrics.record_delete_failure();
                    outcome = JobOutcome::DeleteFailed;
                    let del_err = RepairError::DeleteFailed {
                        path: path.to_string(),
                        source: Box::new(del_err),
                    };
                    err = RepairError::combine([err, Some(del_err)]);
                }
            }
        }

        if !outcome.deleted() {
            metrics.record_retained();
        }

        if let Some(err) = err {
            return JobReport {
                path: path.clone(),
                outcome,
                error: Some(RepairError::Job {
                    path: path.to_string(),
                    source: Box::new(err),
                }),
                cancel_cause: None,
            };
        }

        metrics.time_for_repair.observe(started.elapsed());
        if let Some(queued_for) = self.segment.time_since_inserted(started_wall) {
            metrics.time_since_checker_queue.observe(queued_for);
        }

        JobReport {
            path: path.clone(),
            outcome,
            error: None,
            cancel_cause: None,
        }
    }

    fn record_irreparable(
        &self,
        cx: &Cx,
        detail: IrreparableDetail,
        should_delete: &mut bool,
        failure: &RepairError,
    ) -> JobOutcome {
        let path = &self.segment.path;
        error!(
            target: targets::JOB,
            path = %path,
            error = %failure,
            "segment could not be repaired, adding to irreparable store"
        );
        let record = IrreparableSegment::first_attempt(path.clone(), detail, SystemTime::now());
        match self.deps.store.increment_repair_attempts(cx, &record) {
            Ok(()) => {
                self.deps.metrics.record_irreparable();
                info!(
                    target: targets::IRREPARABLE,
                    path = %path,
                    lost_pieces = record.lost_pieces,
                    "irreparable segment recorded"
                );
                JobOutcome::IrreparableRecorded
            }
            Err(store_err) => {
                self.deps.metrics.record_irreparable_failure();
                *should_delete = false;
                error!(
                    target: targets::IRREPARABLE,
                    path = %path,
                    error = %store_err,
                    "failed to add segment to irreparable store, leaving in repair queue"
                );
                JobOutcome::IrreparableLeftPending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflight::InFlight;
    use crate::limiter::JobLimiter;
    use frankenrepair_core::{checkpoint, sleep_blocking};
    use frankenrepair_storage::{MemoryIrreparableStore, MemoryRepairQueue};
    use std::time::Duration;

    type Script = Box<dyn Fn(&Cx) -> RepairAttempt + Send + Sync>;

    struct ScriptedRepairer {
        script: Script,
    }

    impl ScriptedRepairer {
        fn new(script: impl Fn(&Cx) -> RepairAttempt + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
            })
        }
    }

    impl SegmentRepairer for ScriptedRepairer {
        fn repair(&self, cx: &Cx, _path: &SegmentPath) -> RepairAttempt {
            (self.script)(cx)
        }
    }

    struct Harness {
        queue: Arc<MemoryRepairQueue>,
        store: Arc<MemoryIrreparableStore>,
        metrics: Arc<RepairMetrics>,
        limiter: Arc<JobLimiter>,
        inflight: Arc<InFlight>,
        deps: Arc<JobDeps>,
    }

    fn harness(repairer: Arc<ScriptedRepairer>) -> Harness {
        let queue = Arc::new(MemoryRepairQueue::default());
        let store = Arc::new(MemoryIrreparableStore::new());
        let metrics = Arc::new(RepairMetrics::default());
        let deps = Arc::new(JobDeps {
            queue: queue.clone(),
            store: store.clone(),
            repairer,
            metrics: Arc::clone(&metrics),
        });
        Harness {
            queue,
            store,
            metrics,
            limiter: JobLimiter::new(2).expect("limiter"),
            inflight: InFlight::new(),
            deps,
        }
    }

    /// Admit, open a scope, and claim `segment`, as the dispatcher would.
    fn prepare_job(
        h: &Harness,
        segment: InjuredSegment,
        timeout: Duration,
    ) -> (RepairJob, Arc<JobScope>) {
        h.queue.insert(segment);
        let permit = h.limiter.acquire(&Cx::for_testing(), 1).expect("permit");
        let scope = h.inflight.open(timeout).expect("scope");
        let selected = h.queue.select(scope.cx()).expect("select");
        let job = RepairJob::new(Arc::clone(&scope), selected, Arc::clone(&h.deps), permit);
        (job, scope)
    }

    fn run_job(h: &Harness, segment: InjuredSegment) -> (JobReport, Arc<JobScope>) {
        let (job, scope) = prepare_job(h, segment, Duration::from_secs(60));
        (job.run(), scope)
    }

    fn irreparable_10_3() -> RepairAttempt {
        RepairAttempt::irreparable(IrreparableDetail {
            pieces_required: 10,
            pieces_available: 3,
            segment_detail: b"pointer".to_vec(),
        })
    }

    #[test]
    fn success_deletes_and_records_timing() {
        let h = harness(ScriptedRepairer::new(|_| RepairAttempt::repaired()));
        let inserted = SystemTime::now() - Duration::from_secs(2);
        let (report, scope) = run_job(&h, InjuredSegment::new("ok").with_inserted_at(inserted));

        assert_eq!(report.outcome, JobOutcome::Repaired);
        assert!(report.error.is_none());
        assert!(report.cancel_cause.is_none());
        assert!(h.queue.is_empty());
        assert!(h.store.is_empty());
        assert!(scope.cx().is_cancel_requested());
        assert_eq!(h.limiter.available(), 2);

        let snap = h.metrics.snapshot();
        assert_eq!(snap.repaired, 1);
        assert_eq!(snap.deleted, 1);
        assert_eq!(snap.deadline_exceeded, 0);
        assert_eq!(snap.time_for_repair.count, 1);
        assert_eq!(snap.time_since_checker_queue.count, 1);
        assert!(snap.time_since_checker_queue.max_us >= 2_000_000);
    }

    #[test]
    fn missing_insertion_time_skips_queue_timing() {
        let h = harness(ScriptedRepairer::new(|_| RepairAttempt::repaired()));
        let (report, _) = run_job(&h, InjuredSegment::new("legacy"));
        assert!(report.error.is_none());
        let snap = h.metrics.snapshot();
        assert_eq!(snap.time_for_repair.count, 1);
        assert_eq!(snap.time_since_checker_queue.count, 0);
    }

    #[test]
    fn retain_keeps_entry_without_error() {
        let h = harness(ScriptedRepairer::new(|_| RepairAttempt::retain()));
        let (report, _) = run_job(&h, InjuredSegment::new("keep"));
        assert_eq!(report.outcome, JobOutcome::Retained);
        assert!(report.error.is_none());
        assert!(h.queue.contains(&SegmentPath::from("keep")));
        let snap = h.metrics.snapshot();
        assert_eq!(snap.retained, 1);
        assert_eq!(snap.repaired, 0);
    }

    #[test]
    fn irreparable_is_recorded_and_deleted() {
        let h = harness(ScriptedRepairer::new(|_| irreparable_10_3()));
        let (report, _) = run_job(&h, InjuredSegment::new("lost"));

        assert_eq!(report.outcome, JobOutcome::IrreparableRecorded);
        assert!(h.queue.is_empty());
        let record = h.store.get(&SegmentPath::from("lost")).expect("record");
        assert_eq!(record.lost_pieces, 7);
        assert_eq!(record.repair_attempt_count, 1);
        assert_eq!(record.segment_detail, b"pointer");

        let Some(RepairError::Job { source, .. }) = report.error else {
            panic!("expected job error");
        };
        assert!(matches!(*source, RepairError::Irreparable { .. }));
        let snap = h.metrics.snapshot();
        assert_eq!(snap.irreparable_recorded, 1);
        assert_eq!(snap.repaired, 0);
        assert_eq!(snap.time_for_repair.count, 0);
    }

    #[test]
    fn irreparable_store_failure_leaves_entry_queued() {
        let h = harness(ScriptedRepairer::new(|_| irreparable_10_3()));
        h.store.fail_writes(true);
        let (report, _) = run_job(&h, InjuredSegment::new("stuck"));

        assert_eq!(report.outcome, JobOutcome::IrreparableLeftPending);
        assert!(h.queue.contains(&SegmentPath::from("stuck")));
        assert!(h.store.is_empty());
        assert!(report.error.is_some());
        let snap = h.metrics.snapshot();
        assert_eq!(snap.irreparable_record_failures, 1);
        assert_eq!(snap.deleted, 0);
        assert_eq!(snap.retained, 1);
    }

    #[test]
    fn irreparable_without_delete_is_not_recorded() {
        let h = harness(ScriptedRepairer::new(|_| RepairAttempt {
            should_delete: false,
            result: Err(RepairFailure::Irreparable(IrreparableDetail {
                pieces_required: 4,
                pieces_available: 1,
                segment_detail: Vec::new(),
            })),
        }));
        let (report, _) = run_job(&h, InjuredSegment::new("kept"));
        assert_eq!(report.outcome, JobOutcome::FailedLeftPending);
        assert!(h.store.is_empty());
        assert!(h.queue.contains(&SegmentPath::from("kept")));
    }

    #[test]
    fn unexpected_error_with_delete_removes_entry() {
        let h = harness(ScriptedRepairer::new(|_| {
            RepairAttempt::failed(
                true,
                RepairError::queue("download", std::io::Error::other("bad pointer")),
            )
        }));
        let (report, _) = run_job(&h, InjuredSegment::new("weird"));
        assert_eq!(report.outcome, JobOutcome::FailedDeleted);
        assert!(h.queue.is_empty());
        let snap = h.metrics.snapshot();
        assert_eq!(snap.unexpected_errors, 1);
        assert_eq!(snap.repaired, 0);
        assert!(report.error.expect("error").to_string().contains("bad pointer"));
    }

    #[test]
    fn unexpected_error_without_delete_is_not_counted_as_unexpected() {
        let h = harness(ScriptedRepairer::new(|_| {
            RepairAttempt::failed(false, RepairError::queue("upload", std::io::Error::other("x")))
        }));
        let (report, _) = run_job(&h, InjuredSegment::new("retry"));
        assert_eq!(report.outcome, JobOutcome::FailedLeftPending);
        assert!(h.queue.contains(&SegmentPath::from("retry")));
        assert_eq!(h.metrics.snapshot().unexpected_errors, 0);
    }

    #[test]
    fn delete_failure_is_combined_into_job_error() {
        let h = harness(ScriptedRepairer::new(|_| {
            RepairAttempt::failed(true, RepairError::queue("download", std::io::Error::other("first")))
        }));
        h.queue.fail_deletes(true);
        let (report, _) = run_job(&h, InjuredSegment::new("sticky"));

        assert_eq!(report.outcome, JobOutcome::DeleteFailed);
        let Some(RepairError::Job { source, .. }) = report.error else {
            panic!("expected job error");
        };
        let RepairError::Combined(parts) = *source else {
            panic!("expected combined error");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[1], RepairError::DeleteFailed { .. }));
        assert_eq!(h.metrics.snapshot().delete_failures, 1);
    }

    #[test]
    fn delete_failure_after_success_is_not_counted_as_repaired() {
        let h = harness(ScriptedRepairer::new(|_| RepairAttempt::repaired()));
        h.queue.fail_deletes(true);
        let (report, _) = run_job(&h, InjuredSegment::new("ok-but-stuck"));
        assert_eq!(report.outcome, JobOutcome::DeleteFailed);
        let Some(RepairError::Job { source, .. }) = report.error else {
            panic!("expected job error");
        };
        assert!(matches!(*source, RepairError::DeleteFailed { .. }));
        let snap = h.metrics.snapshot();
        assert_eq!(snap.repaired, 0);
        assert_eq!(snap.deleted, 0);
        assert_eq!(snap.retained, 1);
        assert_eq!(snap.time_for_repair.count, 0);
    }

    #[test]
    fn deadline_expiring_mid_repair_cancels_repairer() {
        let h = harness(ScriptedRepairer::new(|cx: &Cx| {
            match sleep_blocking(cx, "repair", Duration::from_secs(30)) {
                Ok(()) => RepairAttempt::repaired(),
                Err(err) => RepairAttempt::failed(false, err),
            }
        }));
        let (job, _scope) = prepare_job(&h, InjuredSegment::new("slow"), Duration::from_millis(50));
        let started = Instant::now();
        let report = job.run();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.cancel_cause, Some(CancelReason::Timeout));
        assert_eq!(report.outcome, JobOutcome::FailedLeftPending);
        let Some(RepairError::Job { source, .. }) = report.error else {
            panic!("expected job error");
        };
        assert!(source.is_cancelled());
        assert!(h.queue.contains(&SegmentPath::from("slow")));
        assert_eq!(h.limiter.available(), 2);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.deadline_exceeded, 1);
        assert_eq!(snap.cancelled, 0);
    }

    #[test]
    fn shutdown_cancel_surfaces_as_job_error() {
        let h = harness(ScriptedRepairer::new(|cx: &Cx| match checkpoint(cx, "repair") {
            Ok(()) => RepairAttempt::repaired(),
            Err(err) => RepairAttempt::failed(false, err),
        }));
        let (job, scope) = prepare_job(&h, InjuredSegment::new("late"), Duration::from_secs(60));
        scope.cancel(CancelReason::Shutdown);
        let report = job.run();

        assert!(report.error.expect("job error").is_cancelled());
        assert_eq!(report.cancel_cause, Some(CancelReason::Shutdown));
        assert_eq!(h.limiter.available(), 2);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.deadline_exceeded, 0);
    }
}
