use crate::cancel::CancelReason;

/// Unified error type covering every failure mode of the repair dispatch service.
///
/// Every variant carries an actionable message. Only [`RepairError::EmptyQueue`],
/// admission cancellation, and queue failures ever leave the dispatch loop; all
/// per-job errors are contained in the job and surfaced through logs and metrics.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    // === Queue errors ===
    /// The repair queue has no selectable segments. Ends a dispatch burst cleanly.
    #[error("Repair queue is empty. Nothing to dispatch until the checker inserts more segments.")]
    EmptyQueue,

    /// A repair queue operation failed for a reason other than emptiness.
    #[error("Repair queue {op} failed: {source}. Check queue backend availability.")]
    Queue {
        /// Which queue operation failed (`select`, `delete`, `insert`).
        op: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Removing a processed segment from the queue failed.
    #[error("Failed to remove segment {path} from repair queue: {source}")]
    DeleteFailed {
        /// Printable segment path.
        path: String,
        /// The underlying error.
        #[source]
        source: Box<RepairError>,
    },

    // === Repair errors ===
    /// The segment cannot be reconstructed from the pieces currently available.
    #[error(
        "Segment {path} is irreparable: {pieces_available} pieces available, {pieces_required} required. Operator attention needed."
    )]
    Irreparable {
        /// Printable segment path.
        path: String,
        /// Minimum pieces needed to reconstruct the segment.
        pieces_required: i32,
        /// Healthy pieces found.
        pieces_available: i32,
    },

    /// The repairer failed for a reason it did not classify as irreparable.
    #[error("Unexpected error repairing segment {path}: {source}")]
    Repair {
        /// Printable segment path.
        path: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Writing the irreparable record failed. The segment stays in the repair queue.
    #[error(
        "Irreparable store write failed for {path}: {source}. Segment left in repair queue for a later attempt."
    )]
    IrreparableStore {
        /// Printable segment path.
        path: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Job-level classification wrapping whatever ended a repair job.
    #[error("Repair job for {path} failed: {source}")]
    Job {
        /// Printable segment path.
        path: String,
        /// What went wrong inside the job.
        #[source]
        source: Box<RepairError>,
    },

    /// Several errors from one job, in the order they happened.
    #[error("{}", join_messages(.0))]
    Combined(Vec<RepairError>),

    // === Cancellation ===
    /// The operation observed cancellation or an expired deadline.
    #[error("Operation cancelled during {phase}: {reason}")]
    Cancelled {
        /// Which phase was active when cancellation was observed.
        phase: &'static str,
        /// Why the context was cancelled, as far as the observer knows.
        reason: CancelReason,
    },

    // === Configuration errors ===
    /// A configuration value is invalid.
    #[error("Invalid config: {field} = \"{value}\": {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    // === I/O errors ===
    /// Wraps `std::io::Error` (thread spawn, config file reads).
    #[error("I/O error: {0}. Check file permissions and thread limits.")]
    Io(#[from] std::io::Error),

    // === Subsystem errors ===
    /// Wraps errors from collaborators (signal handling, tracing setup, backends).
    #[error("{subsystem} error: {source}")]
    SubsystemError {
        /// Which subsystem produced the error.
        subsystem: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Convenience alias used throughout the frankenrepair crates.
pub type RepairResult<T> = Result<T, RepairError>;

impl RepairError {
    /// True when this error is the distinguished empty-queue signal.
    #[must_use]
    pub const fn is_empty_queue(&self) -> bool {
        matches!(self, Self::EmptyQueue)
    }

    /// True when this error came from cancellation or deadline expiry.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Job { source, .. } | Self::DeleteFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Wrap an arbitrary error as a queue failure.
    pub fn queue(
        op: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Queue {
            op,
            source: source.into(),
        }
    }

    /// Wrap an arbitrary error as a subsystem failure.
    pub fn subsystem(
        subsystem: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SubsystemError {
            subsystem,
            source: source.into(),
        }
    }

    /// Join optional errors: `None`s are dropped, a single error is returned
    /// as-is, several become [`RepairError::Combined`]. Nested combinations are
    /// flattened.
    #[must_use]
    pub fn combine(errors: impl IntoIterator<Item = Option<Self>>) -> Option<Self> {
        let mut flat = Vec::new();
        for error in errors.into_iter().flatten() {
            match error {
                Self::Combined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Combined(flat)),
        }
    }
}

fn join_messages(errors: &[RepairError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RepairError>();
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::WouldBlock, "no threads left");
        let err: RepairError = io_err.into();
        assert!(matches!(err, RepairError::Io(_)));
        assert!(err.to_string().contains("no threads left"));
    }

    #[test]
    fn empty_queue_is_distinguishable() {
        assert!(RepairError::EmptyQueue.is_empty_queue());
        let err = RepairError::queue("select", std::io::Error::other("db down"));
        assert!(!err.is_empty_queue());
        assert!(err.to_string().contains("select"));
        assert!(err.to_string().contains("db down"));
    }

    #[test]
    fn irreparable_message_has_counts() {
        let err = RepairError::Irreparable {
            path: "p/s0/bucket/obj".into(),
            pieces_required: 10,
            pieces_available: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains('3'));
        assert!(msg.contains("p/s0/bucket/obj"));
    }

    #[test]
    fn combine_drops_nones_and_unwraps_singletons() {
        assert!(RepairError::combine([None, None]).is_none());

        let single = RepairError::combine([None, Some(RepairError::EmptyQueue)]);
        assert!(matches!(single, Some(RepairError::EmptyQueue)));

        let both = RepairError::combine([
            Some(RepairError::queue("delete", std::io::Error::other("locked"))),
            Some(RepairError::EmptyQueue),
        ]);
        let Some(RepairError::Combined(inner)) = both else {
            panic!("expected combined error");
        };
        assert_eq!(inner.len(), 2);
    }

    #[test]
    fn combine_flattens_nested_combinations() {
        let nested = RepairError::Combined(vec![RepairError::EmptyQueue, RepairError::EmptyQueue]);
        let combined = RepairError::combine([Some(nested), Some(RepairError::EmptyQueue)]);
        let Some(RepairError::Combined(inner)) = combined else {
            panic!("expected combined error");
        };
        assert_eq!(inner.len(), 3);
    }

    #[test]
    fn combined_display_joins_messages() {
        let err = RepairError::Combined(vec![
            RepairError::queue("delete", std::io::Error::other("first")),
            RepairError::queue("delete", std::io::Error::other("second")),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
        assert!(msg.contains("; "));
    }

    #[test]
    fn job_wrapper_preserves_source_chain() {
        let err = RepairError::Job {
            path: "seg".into(),
            source: Box::new(RepairError::Cancelled {
                phase: "repair",
                reason: CancelReason::Timeout,
            }),
        };
        assert!(err.is_cancelled());
        assert!(err.source().is_some());
        assert!(err.to_string().contains("seg"));
    }

    #[test]
    fn subsystem_error_wraps_arbitrary_errors() {
        let err = RepairError::subsystem("signals", std::io::Error::other("EPERM"));
        assert!(err.to_string().contains("signals"));
        assert!(err.to_string().contains("EPERM"));
    }
}
