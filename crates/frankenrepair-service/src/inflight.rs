//! Job contexts and the watcher that enforces their total timeout.
//!
//! Each dispatched job gets a fresh [`JobScope`]: its own [`Cx`], an
//! optional deadline, and the strongest [`CancelReason`] applied to it so
//! far. The registry keeps weak references only, so a scope lives exactly as
//! long as its job holds it.
//!
//! Deadlines are enforced from outside the job. While any scope is live a
//! `frankenrepair-deadline` thread runs an asupersync timer loop that cancels
//! expired scopes with [`CancelReason::Timeout`]; it exits once the registry
//! is empty and is restarted by the next [`InFlight::open`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{CANCEL_POLL_INTERVAL, CancelReason, Cx, RepairError, RepairResult};
use tracing::{debug, error, warn};

/// Context and deadline of one repair job. Cancels its context on drop.
pub(crate) struct JobScope {
    cx: Cx,
    deadline: Option<Instant>,
    cause: Mutex<Option<CancelReason>>,
}

impl std::fmt::Debug for JobScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScope")
            .field("deadline", &self.deadline)
            .field("cause", &self.cause())
            .field("cancel_requested", &self.cx.is_cancel_requested())
            .finish()
    }
}

impl JobScope {
    fn new(timeout: Duration) -> Self {
        Self {
            cx: Cx::for_request(),
            deadline: Instant::now().checked_add(timeout),
            cause: Mutex::new(None),
        }
    }

    pub(crate) const fn cx(&self) -> &Cx {
        &self.cx
    }

    pub(crate) const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel the job context, keeping the strongest reason seen. Returns
    /// whether `reason` replaced the recorded one.
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        let mut cause = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
        let stronger = cause.is_none_or(|current| reason > current);
        if stronger {
            *cause = Some(reason);
        }
        drop(cause);
        self.cx.set_cancel_requested(true);
        stronger
    }

    /// Why the job context was cancelled, if it was cancelled from outside.
    pub(crate) fn cause(&self) -> Option<CancelReason> {
        *self.cause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

impl Drop for JobScope {
    fn drop(&mut self) {
        self.cx.set_cancel_requested(true);
    }
}

#[derive(Debug, Default)]
struct Registry {
    scopes: Vec<Weak<JobScope>>,
    watcher_running: bool,
}

/// Registry of live job scopes.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    registry: Mutex<Registry>,
}

impl InFlight {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a scope whose deadline is `timeout` from now, starting the
    /// deadline watcher if it is not running.
    ///
    /// # Errors
    ///
    /// [`RepairError::Io`] if the watcher thread could not be spawned.
    pub(crate) fn open(self: &Arc<Self>, timeout: Duration) -> RepairResult<Arc<JobScope>> {
        let scope = Arc::new(JobScope::new(timeout));
        let start_watcher = {
            let mut registry = self.lock();
            registry.scopes.retain(|weak| weak.strong_count() > 0);
            registry.scopes.push(Arc::downgrade(&scope));
            !std::mem::replace(&mut registry.watcher_running, true)
        };
        if start_watcher {
            let inflight = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("frankenrepair-deadline".to_owned())
                .spawn(move || inflight.watch());
            if let Err(err) = spawned {
                self.lock().watcher_running = false;
                return Err(RepairError::Io(err));
            }
        }
        Ok(scope)
    }

    /// Cancel every live scope with `reason`. Returns how many were live.
    pub(crate) fn cancel_all(&self, reason: CancelReason) -> usize {
        let registry = self.lock();
        let mut live = 0;
        for scope in registry.scopes.iter().filter_map(Weak::upgrade) {
            scope.cancel(reason);
            live += 1;
        }
        drop(registry);
        if live > 0 {
            debug!(target: targets::SERVICE, live, reason = %reason, "cancelled in-flight jobs");
        }
        live
    }

    #[must_use]
    pub(crate) fn live(&self) -> usize {
        self.lock()
            .scopes
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    #[cfg(test)]
    fn is_watching(&self) -> bool {
        self.lock().watcher_running
    }

    fn watch(&self) {
        let rt = match asupersync::runtime::RuntimeBuilder::current_thread().build() {
            Ok(rt) => rt,
            Err(err) => {
                self.lock().watcher_running = false;
                error!(
                    target: targets::SERVICE,
                    error = %err,
                    "failed to create deadline watcher runtime; job deadlines are not enforced"
                );
                return;
            }
        };
        rt.block_on(async {
            while self.sweep(Instant::now()) {
                asupersync::time::sleep(asupersync::time::wall_now(), CANCEL_POLL_INTERVAL).await;
            }
        });
        debug!(target: targets::SERVICE, "deadline watcher idle, exiting");
    }

    /// Cancel expired scopes and forget dropped ones. Returns whether the
    /// watcher should keep running; clears the running flag when it should not.
    fn sweep(&self, now: Instant) -> bool {
        let mut registry = self.lock();
        registry.scopes.retain(|weak| {
            let Some(scope) = weak.upgrade() else {
                return false;
            };
            if scope.is_expired(now) && scope.cancel(CancelReason::Timeout) {
                warn!(target: targets::SERVICE, "repair job deadline exceeded, cancelling");
            }
            true
        });
        if registry.scopes.is_empty() {
            registry.watcher_running = false;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn deadline_cancels_scope_with_timeout() {
        let inflight = InFlight::new();
        let scope = inflight.open(Duration::from_millis(20)).expect("open");
        assert!(!scope.cx().is_cancel_requested());
        assert!(scope.deadline().is_some());

        assert!(wait_until(Duration::from_secs(5), || scope.cx().is_cancel_requested()));
        assert_eq!(scope.cause(), Some(CancelReason::Timeout));
    }

    #[test]
    fn stronger_reason_wins_over_timeout() {
        let inflight = InFlight::new();
        let scope = inflight.open(Duration::from_secs(60)).expect("open");
        assert!(scope.cancel(CancelReason::Shutdown));
        assert!(!scope.cancel(CancelReason::Timeout));
        assert_eq!(scope.cause(), Some(CancelReason::Shutdown));
        assert!(scope.cancel(CancelReason::Abort));
        assert_eq!(scope.cause(), Some(CancelReason::Abort));
    }

    #[test]
    fn cancel_all_reaches_only_live_scopes() {
        let inflight = InFlight::new();
        let kept = inflight.open(Duration::from_secs(60)).expect("open");
        let dropped = inflight.open(Duration::from_secs(60)).expect("open");
        drop(dropped);
        assert_eq!(inflight.live(), 1);

        assert_eq!(inflight.cancel_all(CancelReason::Shutdown), 1);
        assert!(kept.cx().is_cancel_requested());
        assert_eq!(kept.cause(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn watcher_exits_when_idle_and_restarts() {
        let inflight = InFlight::new();
        let first = inflight.open(Duration::from_secs(60)).expect("open");
        assert!(inflight.is_watching());
        drop(first);
        assert!(wait_until(Duration::from_secs(5), || !inflight.is_watching()));

        let second = inflight.open(Duration::from_millis(10)).expect("open");
        assert!(inflight.is_watching());
        assert!(wait_until(Duration::from_secs(5), || second.cause() == Some(CancelReason::Timeout)));
    }

    #[test]
    fn sweep_leaves_unexpired_scopes_alone() {
        let inflight = InFlight::new();
        let scope = Arc::new(JobScope::new(Duration::from_secs(60)));
        {
            let mut registry = inflight.lock();
            registry.scopes.push(Arc::downgrade(&scope));
            registry.watcher_running = true;
        }
        assert!(inflight.sweep(Instant::now()));
        assert!(scope.cause().is_none());

        assert!(inflight.sweep(Instant::now() + Duration::from_secs(61)));
        assert_eq!(scope.cause(), Some(CancelReason::Timeout));

        drop(scope);
        assert!(!inflight.sweep(Instant::now()));
        assert!(!inflight.is_watching());
    }

    #[test]
    fn dropped_scope_is_no_longer_live() {
        let inflight = InFlight::new();
        let scope = inflight.open(Duration::from_secs(60)).expect("open");
        let observer = Arc::downgrade(&scope);
        drop(scope);
        assert!(observer.upgrade().is_none());
        assert_eq!(inflight.live(), 0);
    }
}
