//! Process shutdown: turn `SIGINT`/`SIGTERM` into root context cancellation.
//!
//! The first interrupt or terminate moves the coordinator to
//! [`ShutdownState::ShuttingDown`] and cancels its root [`Cx`]; the dispatch
//! loop stops admitting work and in-flight jobs are cancelled with
//! [`CancelReason::Shutdown`](frankenrepair_core::CancelReason::Shutdown). A
//! second `SIGINT` within [`FORCE_EXIT_WINDOW`] escalates to
//! [`ShutdownState::ForceExit`], after which the service stops waiting for
//! jobs to drain.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{Cx, RepairError, RepairResult};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{debug, info, warn};

/// Time window where a second `SIGINT` forces immediate exit.
pub const FORCE_EXIT_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    ForceExit,
}

impl ShutdownState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ShuttingDown,
            2 => Self::ForceExit,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    Error(String),
    UserRequest,
}

#[cfg(not(windows))]
struct SignalListener {
    handle: signal_hook::iterator::Handle,
    thread: thread::JoinHandle<()>,
}

/// Owns the root [`Cx`] of a repair process and cancels it when shutdown is
/// requested, by signal or by call.
pub struct ShutdownCoordinator {
    root: Cx,
    state: AtomicU8,
    reason: Mutex<Option<ShutdownReason>>,
    last_interrupt: Mutex<Option<Instant>>,
    #[cfg(not(windows))]
    listener: Mutex<Option<SignalListener>>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("reason", &self.current_reason())
            .field("root_cancelled", &self.root.is_cancel_requested())
            .finish_non_exhaustive()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Cx::for_request(),
            state: AtomicU8::new(ShutdownState::Running as u8),
            reason: Mutex::new(None),
            last_interrupt: Mutex::new(None),
            #[cfg(not(windows))]
            listener: Mutex::new(None),
        }
    }

    /// The root context. Cancelled once shutdown is requested.
    #[must_use]
    pub const fn cx(&self) -> &Cx {
        &self.root
    }

    /// Start the signal listener thread. A no-op if it is already running.
    ///
    /// # Errors
    ///
    /// [`RepairError::SubsystemError`] if the handlers or the listener
    /// thread could not be set up.
    pub fn register_signals(self: &Arc<Self>) -> RepairResult<()> {
        #[cfg(windows)]
        {
            warn!(
                target: targets::SHUTDOWN,
                "signal listener is not supported on windows; using shutdown requests only"
            );
            Ok(())
        }

        #[cfg(not(windows))]
        {
            let mut slot = lock(&self.listener);
            if slot.is_some() {
                return Ok(());
            }
            let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])
                .map_err(|error| signal_error("failed to register signal listeners", &error))?;
            let handle = signals.handle();
            let coordinator = Arc::clone(self);
            let thread = thread::Builder::new()
                .name("frankenrepair-signals".to_owned())
                .spawn(move || {
                    for signal in signals.forever() {
                        coordinator.handle_signal(signal);
                    }
                })
                .map_err(|error| signal_error("failed to start signal listener thread", &error))?;
            *slot = Some(SignalListener { handle, thread });
            debug!(target: targets::SHUTDOWN, "signal listener started");
            Ok(())
        }
    }

    /// Stop the signal listener thread, if one is running.
    pub fn stop_signal_listener(&self) {
        #[cfg(not(windows))]
        {
            let Some(listener) = lock(&self.listener).take() else {
                return;
            };
            listener.handle.close();
            if let Err(error) = listener.thread.join() {
                warn!(
                    target: targets::SHUTDOWN,
                    ?error,
                    "signal listener thread panicked while stopping"
                );
            }
        }
    }

    /// Request graceful shutdown. Only the first request's reason is kept.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(target: targets::SHUTDOWN, ?reason, "shutdown requested");
            *lock(&self.reason) = Some(reason);
            self.root.set_cancel_requested(true);
        }
    }

    #[must_use]
    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    #[must_use]
    pub fn is_force_exit_requested(&self) -> bool {
        self.state() == ShutdownState::ForceExit
    }

    #[must_use]
    pub fn current_reason(&self) -> Option<ShutdownReason> {
        lock(&self.reason).clone()
    }

    fn handle_signal(&self, signal: i32) {
        match signal {
            SIGINT => self.handle_interrupt(Instant::now()),
            SIGTERM => {
                info!(target: targets::SHUTDOWN, "received SIGTERM, draining repair jobs");
                self.request_shutdown(ShutdownReason::Signal(SIGTERM));
            }
            _ => debug!(target: targets::SHUTDOWN, signal, "ignoring unexpected signal"),
        }
    }

    fn handle_interrupt(&self, now: Instant) {
        let mut last = lock(&self.last_interrupt);
        let previous = last.replace(now);
        match self.state() {
            ShutdownState::Running => {
                drop(last);
                info!(target: targets::SHUTDOWN, "received SIGINT, draining repair jobs");
                self.request_shutdown(ShutdownReason::Signal(SIGINT));
            }
            ShutdownState::ShuttingDown => {
                if previous.is_some_and(|at| now.saturating_duration_since(at) <= FORCE_EXIT_WINDOW) {
                    self.state
                        .store(ShutdownState::ForceExit as u8, Ordering::Release);
                    self.root.set_cancel_requested(true);
                    warn!(target: targets::SHUTDOWN, "second SIGINT within window, forcing exit");
                } else {
                    debug!(
                        target: targets::SHUTDOWN,
                        "SIGINT outside force-exit window; still draining"
                    );
                }
            }
            ShutdownState::ForceExit => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn process_signal_for_test(&self, signal: i32) {
        self.handle_signal(signal);
    }

    #[cfg(test)]
    pub(crate) fn process_interrupt_at_for_test(&self, at: Instant) {
        self.handle_interrupt(at);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(not(windows))]
fn signal_error(context: &str, error: &io::Error) -> RepairError {
    RepairError::subsystem("signals", io::Error::other(format!("{context}: {error}")))
}
