//! Timer-driven repeating trigger for the dispatch loop.
//!
//! [`Cycle::run`] executes its step once immediately and then once per
//! interval. Idle time between steps is spent in an asupersync timer sleep,
//! never inside the state lock. Other threads steer it through the
//! control methods: [`stop`](Cycle::stop), [`pause`](Cycle::pause),
//! [`restart`](Cycle::restart), [`trigger`](Cycle::trigger),
//! [`trigger_wait`](Cycle::trigger_wait), and
//! [`change_interval`](Cycle::change_interval). A running step is never
//! interrupted; controls take effect between steps.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{Cx, RepairError, RepairResult};
use tracing::{debug, info};

/// Maximum time the idle loop sleeps before rechecking its context and controls.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct CycleState {
    interval: Duration,
    running: bool,
    paused: bool,
    stop_requested: bool,
    restart_pending: bool,
    trigger_pending: bool,
    /// Incremented by each `trigger` call.
    triggers_requested: u64,
    /// Highest trigger sequence a completed step started after.
    triggers_served: u64,
    steps_completed: u64,
}

/// Repeating trigger. One `run` at a time; controls are callable from any thread.
#[derive(Debug)]
pub struct Cycle {
    state: Mutex<CycleState>,
    cv: Condvar,
}

/// Clears the running flag and wakes waiters however `run` exits.
struct RunningGuard<'a> {
    cycle: &'a Cycle,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.cycle.lock();
        st.running = false;
        drop(st);
        self.cycle.cv.notify_all();
    }
}

enum Wake {
    Step { served: u64 },
    Sleep(Duration),
    Exit(&'static str),
}

impl Cycle {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(CycleState {
                interval,
                running: false,
                paused: false,
                stop_requested: false,
                restart_pending: false,
                trigger_pending: false,
                triggers_requested: 0,
                triggers_served: 0,
                steps_completed: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `step` now and after every interval until `cx` is cancelled,
    /// [`stop`](Self::stop) is called, or `step` fails.
    ///
    /// # Errors
    ///
    /// The first error returned by `step`, or a subsystem error if the cycle
    /// is already running elsewhere.
    pub async fn run<F>(&self, cx: &Cx, mut step: F) -> RepairResult<()>
    where
        F: FnMut(&Cx) -> RepairResult<()>,
    {
        {
            let mut st = self.lock();
            if st.running {
                return Err(RepairError::subsystem(
                    "cycle",
                    std::io::Error::other("cycle is already running"),
                ));
            }
            st.running = true;
        }
        let _running = RunningGuard { cycle: self };
        info!(
            target: targets::CYCLE,
            interval_ms = u64::try_from(self.interval().as_millis()).unwrap_or(u64::MAX),
            "cycle started"
        );

        let mut next_tick = Instant::now();
        let mut immediate = true;
        loop {
            let served = match self.poll_wake(cx, &mut next_tick, immediate) {
                Wake::Step { served } => served,
                Wake::Sleep(slice) => {
                    asupersync::time::sleep(asupersync::time::wall_now(), slice).await;
                    continue;
                }
                Wake::Exit(why) => {
                    info!(target: targets::CYCLE, reason = why, "cycle stopped");
                    return Ok(());
                }
            };

            immediate = false;
            let started = Instant::now();
            let span = tracing::debug_span!(target: targets::CYCLE, "frankenrepair::cycle_tick");
            let result = span.in_scope(|| step(cx));

            let mut st = self.lock();
            st.triggers_served = st.triggers_served.max(served);
            st.steps_completed += 1;
            next_tick = started + st.interval;
            drop(st);
            self.cv.notify_all();

            if let Err(err) = result {
                debug!(target: targets::CYCLE, error = %err, "cycle step failed");
                return Err(err);
            }
        }
    }

    fn poll_wake(&self, cx: &Cx, next_tick: &mut Instant, immediate: bool) -> Wake {
        let mut st = self.lock();
        if cx.is_cancel_requested() {
            return Wake::Exit("context cancelled");
        }
        if st.stop_requested {
            return Wake::Exit("stop requested");
        }
        let now = Instant::now();
        if st.restart_pending {
            st.restart_pending = false;
            *next_tick = now + st.interval;
        }
        if immediate || st.trigger_pending || (!st.paused && now >= *next_tick) {
            st.trigger_pending = false;
            return Wake::Step {
                served: st.triggers_requested,
            };
        }
        if st.paused {
            Wake::Sleep(WAIT_POLL_INTERVAL)
        } else {
            Wake::Sleep(next_tick.saturating_duration_since(now).min(WAIT_POLL_INTERVAL))
        }
    }

    /// Ask `run` to return after the current step. Sticky: later `run` calls
    /// on this cycle return immediately.
    pub fn stop(&self) {
        self.lock().stop_requested = true;
        self.cv.notify_all();
    }

    /// Suspend interval ticks. Triggers still run the step.
    pub fn pause(&self) {
        self.lock().paused = true;
        self.cv.notify_all();
    }

    /// Resume ticks, with the next one a full interval from now.
    pub fn restart(&self) {
        let mut st = self.lock();
        st.paused = false;
        st.restart_pending = true;
        drop(st);
        self.cv.notify_all();
    }

    /// Run the step as soon as the current one (if any) finishes.
    pub fn trigger(&self) {
        let mut st = self.lock();
        st.triggers_requested += 1;
        st.trigger_pending = true;
        drop(st);
        self.cv.notify_all();
    }

    /// Trigger a step and block until a step that started after this call
    /// completes, or the cycle stops running.
    pub fn trigger_wait(&self) {
        let mut st = self.lock();
        if !st.running {
            return;
        }
        st.triggers_requested += 1;
        st.trigger_pending = true;
        let wanted = st.triggers_requested;
        self.cv.notify_all();
        while st.running && st.triggers_served < wanted {
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Replace the interval and restart the tick schedule from now.
    pub fn change_interval(&self, interval: Duration) {
        let mut st = self.lock();
        st.interval = interval;
        st.restart_pending = true;
        drop(st);
        self.cv.notify_all();
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.lock().interval
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    #[must_use]
    pub fn steps_completed(&self) -> u64 {
        self.lock().steps_completed
    }

    /// Block until `run` has started, or `timeout` passes. Returns whether it is running.
    #[must_use]
    pub fn wait_running(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        while !st.running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            st = self
                .cv
                .wait_timeout(st, remaining.min(WAIT_POLL_INTERVAL))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
