//! Cancellation helpers over [`asupersync::Cx`].
//!
//! Repairers and queue backends are blocking code running on job threads,
//! outside any runtime. They observe cancellation by polling the context:
//! [`checkpoint`] at phase boundaries and [`sleep_blocking`] wherever they
//! would otherwise park. Job deadlines are enforced by whoever owns the job
//! context, by setting its cancel flag; these helpers only read it.

use std::thread;
use std::time::{Duration, Instant};

use asupersync::Cx;
use serde::{Deserialize, Serialize};

use crate::error::{RepairError, RepairResult};

/// Upper bound on how long a blocking wait goes without checking its context.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why a context was cancelled, ordered from weakest to strongest.
///
/// Owners that record a reason keep the strongest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The job's total timeout elapsed.
    Timeout,
    /// The context's owner cancelled it.
    Requested,
    /// The service is shutting down.
    Shutdown,
    /// Forced exit; nothing further should run.
    Abort,
}

impl CancelReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "deadline exceeded",
            Self::Requested => "cancel requested",
            Self::Shutdown => "service shutting down",
            Self::Abort => "aborted",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail with [`RepairError::Cancelled`] if `cx` has been cancelled.
///
/// # Errors
///
/// [`RepairError::Cancelled`] tagged with `phase`.
pub fn checkpoint(cx: &Cx, phase: &'static str) -> RepairResult<()> {
    if cx.is_cancel_requested() || cx.checkpoint().is_err() {
        return Err(RepairError::Cancelled {
            phase,
            reason: CancelReason::Requested,
        });
    }
    Ok(())
}

/// Block the current thread for `duration`, returning early once `cx` is
/// cancelled. Wakes at least every [`CANCEL_POLL_INTERVAL`].
///
/// # Errors
///
/// [`RepairError::Cancelled`] tagged with `phase` if the wait was cut short.
pub fn sleep_blocking(cx: &Cx, phase: &'static str, duration: Duration) -> RepairResult<()> {
    let until = Instant::now().checked_add(duration);
    loop {
        checkpoint(cx, phase)?;
        let now = Instant::now();
        let slice = match until {
            Some(until) if now >= until => return Ok(()),
            Some(until) => until.saturating_duration_since(now).min(CANCEL_POLL_INTERVAL),
            None => CANCEL_POLL_INTERVAL,
        };
        thread::sleep(slice);
    }
}
