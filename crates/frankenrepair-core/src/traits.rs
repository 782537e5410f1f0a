//! Collaborator interfaces for the repair dispatch service.
//!
//! - [`RepairQueue`]: durable queue of injured segments.
//! - [`IrreparableStore`]: attempt records for segments that cannot be rebuilt.
//! - [`SegmentRepairer`]: the byte-level repair capability.
//!
//! Every operation receives a capability context (`&Cx`) as its first
//! parameter. Implementations are shared across job threads, so all traits
//! require `Send + Sync`.

use std::fmt;

use asupersync::Cx;
use crate::error::{RepairError, RepairResult};
use crate::types::{InjuredSegment, IrreparableDetail, IrreparableSegment, SegmentPath};

// ─── Repair Queue ───────────────────────────────────────────────────────────

/// Queue of segments waiting for repair.
///
/// # Contract
///
/// - `select()` atomically claims one pending item and stamps it attempted.
///   When nothing is selectable it returns [`RepairError::EmptyQueue`].
/// - `delete()` of an absent item is not an error.
pub trait RepairQueue: Send + Sync {
    /// Claim the next segment to repair.
    ///
    /// # Errors
    ///
    /// [`RepairError::EmptyQueue`] when no item qualifies, or a queue/cancel
    /// error from the backend.
    fn select(&self, cx: &Cx) -> RepairResult<InjuredSegment>;

    /// Remove a processed segment.
    ///
    /// # Errors
    ///
    /// Backend or cancellation errors.
    fn delete(&self, cx: &Cx, segment: &InjuredSegment) -> RepairResult<()>;
}

// ─── Irreparable Store ──────────────────────────────────────────────────────

/// Store of segments the repairer declared irreparable.
pub trait IrreparableStore: Send + Sync {
    /// Insert `segment`, or merge it into the existing record for the same
    /// path by adding its attempt count and taking its last-attempt time.
    ///
    /// # Errors
    ///
    /// Backend errors. The dispatch service treats these as non-fatal.
    fn increment_repair_attempts(&self, cx: &Cx, segment: &IrreparableSegment) -> RepairResult<()>;
}

// ─── Segment Repairer ───────────────────────────────────────────────────────

/// Why a repair attempt failed.
#[derive(Debug)]
pub enum RepairFailure {
    /// Too few healthy pieces remain to reconstruct the segment.
    Irreparable(IrreparableDetail),
    /// Anything else (network, storage node, cancellation).
    Other(RepairError),
}

impl RepairFailure {
    #[must_use]
    pub const fn is_irreparable(&self) -> bool {
        matches!(self, Self::Irreparable(_))
    }

    /// Convert into the crate error, attributing it to `path`.
    #[must_use]
    pub fn into_error(self, path: &SegmentPath) -> RepairError {
        match self {
            Self::Irreparable(detail) => RepairError::Irreparable {
                path: path.to_string(),
                pieces_required: detail.pieces_required,
                pieces_available: detail.pieces_available,
            },
            Self::Other(RepairError::Repair { path, source }) => {
                RepairError::Repair { path, source }
            }
            Self::Other(err @ RepairError::Cancelled { .. }) => err,
            Self::Other(other) => RepairError::Repair {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl fmt::Display for RepairFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Irreparable(detail) => write!(
                f,
                "irreparable: {} of {} required pieces available",
                detail.pieces_available, detail.pieces_required
            ),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}

impl From<RepairError> for RepairFailure {
    fn from(err: RepairError) -> Self {
        Self::Other(err)
    }
}

/// Outcome of one call to [`SegmentRepairer::repair`].
///
/// `should_delete` is the repairer's verdict on whether the queue entry is
/// resolved, independent of whether `result` is a failure.
#[derive(Debug)]
pub struct RepairAttempt {
    pub should_delete: bool,
    pub result: Result<(), RepairFailure>,
}

impl RepairAttempt {
    /// Repaired; remove from the queue.
    #[must_use]
    pub const fn repaired() -> Self {
        Self {
            should_delete: true,
            result: Ok(()),
        }
    }

    /// Nothing was done and the entry should stay queued.
    #[must_use]
    pub const fn retain() -> Self {
        Self {
            should_delete: false,
            result: Ok(()),
        }
    }

    #[must_use]
    pub const fn irreparable(detail: IrreparableDetail) -> Self {
        Self {
            should_delete: true,
            result: Err(RepairFailure::Irreparable(detail)),
        }
    }

    #[must_use]
    pub const fn failed(should_delete: bool, err: RepairError) -> Self {
        Self {
            should_delete,
            result: Err(RepairFailure::Other(err)),
        }
    }
}

/// The byte-level repair capability.
pub trait SegmentRepairer: Send + Sync {
    /// Attempt to repair the segment at `path` within the deadline on `cx`.
    fn repair(&self, cx: &Cx, path: &SegmentPath) -> RepairAttempt;
}

impl<T: SegmentRepairer + ?Sized> SegmentRepairer for std::sync::Arc<T> {
    fn repair(&self, cx: &Cx, path: &SegmentPath) -> RepairAttempt {
        (**self).repair(cx, path)
    }
}

impl<T: RepairQueue + ?Sized> RepairQueue for std::sync::Arc<T> {
    fn select(&self, cx: &Cx) -> RepairResult<InjuredSegment> {
        (**self).select(cx)
    }

    fn delete(&self, cx: &Cx, segment: &InjuredSegment) -> RepairResult<()> {
        (**self).delete(cx, segment)
    }
}

impl<T: IrreparableStore + ?Sized> IrreparableStore for std::sync::Arc<T> {
    fn increment_repair_attempts(&self, cx: &Cx, segment: &IrreparableSegment) -> RepairResult<()> {
        (**self).increment_repair_attempts(cx, segment)
    }
}
