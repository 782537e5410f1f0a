//! Core traits, types, context, and error types for the frankenrepair
//! repair dispatch service.
//!
//! This crate defines the collaborator interfaces (`RepairQueue`,
//! `IrreparableStore`, `SegmentRepairer`), the segment data model,
//! configuration, metrics, and the shared error type. The capability context
//! is `asupersync::Cx`, re-exported here together with the blocking
//! cancellation helpers in [`cancel`]. Every other crate in the workspace
//! depends on it.

pub mod cancel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_config;
pub mod traits;
pub mod types;

pub use asupersync::Cx;
pub use cancel::{CANCEL_POLL_INTERVAL, CancelReason, checkpoint, sleep_blocking};
pub use config::{RepairerConfig, SegmentRepairerOptions};
pub use error::{RepairError, RepairResult};
pub use metrics::{DurationStat, DurationStatSnapshot, RepairMetrics, RepairMetricsSnapshot};
pub use traits::{IrreparableStore, RepairAttempt, RepairFailure, RepairQueue, SegmentRepairer};
pub use types::{
    InjuredSegment, IrreparableDetail, IrreparableSegment, SegmentPath, unix_seconds,
};
