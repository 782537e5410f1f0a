//! The repair dispatch service.
//!
//! # Architecture
//!
//! ```text
//! Cycle ──tick──> process_while_queue_has_items ──loop──> process
//!                                                           │
//!                   acquire unit ── open job scope (deadline) ── select
//!                                                           │
//!                                                   spawn RepairJob
//!                                              (owns permit + job scope)
//! ```
//!
//! The job deadline starts before `select` so the per-job budget covers the
//! queue fetch, but not the wait for an admission unit. A watcher thread
//! cancels job contexts whose deadline has passed; cancelling the service
//! context cancels every in-flight job. Only admission and queue failures
//! stop the loop; everything that goes wrong inside a job stays there and
//! surfaces through logs and [`RepairMetrics`].

use std::sync::Arc;
use std::thread;

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{
    CANCEL_POLL_INTERVAL, CancelReason, Cx, IrreparableStore, RepairError, RepairMetrics,
    RepairQueue, RepairResult, RepairerConfig, SegmentRepairer,
};
use tracing::{debug, error, info, warn};

use crate::cycle::Cycle;
use crate::inflight::InFlight;
use crate::limiter::JobLimiter;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::worker::{JobDeps, RepairJob};

/// Bounded-concurrency dispatcher pulling injured segments off the repair
/// queue and running one repair job per segment.
pub struct RepairService {
    config: RepairerConfig,
    limiter: Arc<JobLimiter>,
    cycle: Cycle,
    inflight: Arc<InFlight>,
    deps: Arc<JobDeps>,
    metrics: Arc<RepairMetrics>,
}

impl std::fmt::Debug for RepairService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairService")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("cycle", &self.cycle)
            .field("jobs_in_flight", &self.inflight.live())
            .finish_non_exhaustive()
    }
}

impl RepairService {
    /// Build a service from validated configuration and its collaborators.
    ///
    /// # Errors
    ///
    /// [`RepairError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: RepairerConfig,
        queue: Arc<dyn RepairQueue>,
        store: Arc<dyn IrreparableStore>,
        repairer: Arc<dyn SegmentRepairer>,
    ) -> RepairResult<Self> {
        config.validate()?;
        let limiter = JobLimiter::new(config.max_repair)?;
        let metrics = Arc::new(RepairMetrics::default());
        let deps = Arc::new(JobDeps {
            queue,
            store,
            repairer,
            metrics: Arc::clone(&metrics),
        });
        Ok(Self {
            cycle: Cycle::new(config.interval()),
            config,
            limiter,
            inflight: InFlight::new(),
            deps,
            metrics,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &RepairerConfig {
        &self.config
    }

    /// The poll cycle, for triggering, pausing, or changing the interval.
    #[must_use]
    pub const fn cycle(&self) -> &Cycle {
        &self.cycle
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<JobLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RepairMetrics> {
        &self.metrics
    }

    /// Run the dispatch loop until `cx` is cancelled, [`close`](Self::close)
    /// is called, or fetching from the queue fails, then wait for every
    /// in-flight job to finish. Cancelling `cx` also cancels in-flight jobs.
    ///
    /// # Errors
    ///
    /// The admission or queue error that stopped the loop. In-flight jobs are
    /// still drained before it is returned.
    pub async fn run(&self, cx: &Cx) -> RepairResult<()> {
        let result = self.dispatch(cx).await;
        if cx.is_cancel_requested() {
            self.inflight.cancel_all(CancelReason::Requested);
        }
        self.drain(|| false).await;
        info!(target: targets::SERVICE, ok = result.is_ok(), "repair service stopped");
        result
    }

    /// Run on the coordinator's root context until shutdown is requested.
    ///
    /// A dispatch error requests shutdown with [`ShutdownReason::Error`]. On
    /// shutdown in-flight jobs are cancelled and drained; a forced exit
    /// aborts them and stops waiting.
    ///
    /// # Errors
    ///
    /// The admission or queue error that stopped the loop. Cancellation
    /// caused by the shutdown itself is not an error.
    pub async fn run_with_shutdown(&self, shutdown: &ShutdownCoordinator) -> RepairResult<()> {
        let cx = shutdown.cx();
        let result = self.dispatch(cx).await;
        if let Err(err) = &result
            && !err.is_cancelled()
        {
            shutdown.request_shutdown(ShutdownReason::Error(err.to_string()));
        }
        let reason = if shutdown.is_force_exit_requested() {
            CancelReason::Abort
        } else {
            CancelReason::Shutdown
        };
        self.inflight.cancel_all(reason);

        let drained = self
            .drain(|| {
                let forced = shutdown.is_force_exit_requested();
                if forced {
                    self.inflight.cancel_all(CancelReason::Abort);
                }
                forced
            })
            .await;
        if !drained {
            warn!(
                target: targets::SERVICE,
                in_flight = self.limiter.in_use(),
                "forced exit, not waiting for in-flight repair jobs"
            );
        }
        info!(
            target: targets::SERVICE,
            reason = ?shutdown.current_reason(),
            ok = result.is_ok(),
            "repair service stopped"
        );
        match result {
            Err(err) if err.is_cancelled() && shutdown.is_shutting_down() => Ok(()),
            other => other,
        }
    }

    async fn dispatch(&self, cx: &Cx) -> RepairResult<()> {
        info!(
            target: targets::SERVICE,
            max_repair = self.config.max_repair,
            interval_ms = self.config.interval_ms,
            total_timeout_ms = self.config.total_timeout_ms,
            "repair service started"
        );
        self.cycle
            .run(cx, |cx| self.process_while_queue_has_items(cx))
            .await
    }

    /// Wait for every admitted job to release its unit, or until `give_up`
    /// returns true. Returns whether the limiter went idle.
    async fn drain(&self, mut give_up: impl FnMut() -> bool) -> bool {
        while self.limiter.in_use() > 0 {
            if give_up() {
                return false;
            }
            asupersync::time::sleep(asupersync::time::wall_now(), CANCEL_POLL_INTERVAL).await;
        }
        true
    }

    /// Dispatch jobs until the queue reports empty.
    ///
    /// # Errors
    ///
    /// Any error from [`process`](Self::process) other than
    /// [`RepairError::EmptyQueue`].
    pub fn process_while_queue_has_items(&self, cx: &Cx) -> RepairResult<()> {
        let span = tracing::debug_span!(target: targets::SERVICE, "frankenrepair::dispatch_burst");
        let _entered = span.enter();
        loop {
            match self.process(cx) {
                Ok(()) => {}
                Err(err) if err.is_empty_queue() => {
                    self.metrics.record_empty_queue();
                    debug!(target: targets::SERVICE, "repair queue drained");
                    return Ok(());
                }
                Err(err) => {
                    self.metrics.record_dispatch_error();
                    error!(target: targets::SERVICE, error = %err, "process");
                    return Err(err);
                }
            }
        }
    }

    /// Claim one segment and hand it to a new repair job.
    ///
    /// Returns as soon as the job is spawned; it does not wait for the repair.
    ///
    /// # Errors
    ///
    /// - [`RepairError::Cancelled`] if `cx` was cancelled while waiting for
    ///   admission, or the job deadline passed during `select`.
    /// - [`RepairError::EmptyQueue`] or a queue error from `select`.
    /// - [`RepairError::Io`] if the job or deadline thread could not be spawned.
    pub fn process(&self, cx: &Cx) -> RepairResult<()> {
        let permit = self.limiter.acquire(cx, 1)?;

        // Deadline starts before the fetch: the job budget includes select time.
        let scope = self.inflight.open(self.config.total_timeout())?;

        let segment = match self.deps.queue.select(scope.cx()) {
            Ok(segment) => segment,
            Err(err) => {
                drop(scope);
                drop(permit);
                return Err(err);
            }
        };
        self.metrics.record_selected();
        debug!(target: targets::SERVICE, path = %segment.path, "retrieved segment from repair queue");

        let job = RepairJob::new(scope, segment, Arc::clone(&self.deps), permit);
        thread::Builder::new()
            .name("frankenrepair-job".to_owned())
            .spawn(move || {
                let _report = job.run();
            })?;
        Ok(())
    }

    /// Block the calling thread until every admitted job has released its unit.
    pub fn wait_for_pending_repairs(&self) {
        self.limiter.wait_idle();
    }

    /// Stop the poll cycle. A running burst finishes its current `process`
    /// call; [`run`](Self::run) then drains in-flight jobs and returns.
    pub fn close(&self) {
        info!(target: targets::SERVICE, "repair service closing");
        self.cycle.stop();
    }
}
