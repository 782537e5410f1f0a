//! In-process storage backends for frankenrepair.
//!
//! This crate provides the reference repair queue and irreparable segment
//! store used by tests, local runs, and embedders that do not bring their
//! own durable backends.
#![allow(clippy::missing_const_for_fn, clippy::missing_errors_doc)]

pub mod irreparable;
pub mod repair_queue;

pub use irreparable::{
    IrreparableMetrics, IrreparableMetricsSnapshot, MemoryIrreparableStore, MergeOutcome,
};
pub use repair_queue::{
    DEFAULT_REATTEMPT_AFTER, MemoryRepairQueue, QueueMetrics, QueueMetricsSnapshot,
    RepairQueueConfig,
};
