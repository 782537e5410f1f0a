//! # frankenrepair
//!
//! Bounded-concurrency repair dispatch for injured storage segments.
//!
//! A checker puts damaged segments into a repair queue. [`RepairService`]
//! polls that queue on a fixed interval, claims one segment per admission
//! unit, and runs a repair job on its own thread with a per-job deadline.
//! Contexts are [`asupersync`](https://docs.rs/asupersync) `Cx` values;
//! repairers observe cancellation through [`checkpoint`] and
//! [`sleep_blocking`].
//! Each job classifies the repairer's answer: repaired, retained, failed, or
//! irreparable. Irreparable segments are recorded in an [`IrreparableStore`]
//! before they leave the queue.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use frankenrepair::prelude::*;
//! use frankenrepair::{MemoryIrreparableStore, MemoryRepairQueue};
//!
//! struct NoopRepairer;
//! impl SegmentRepairer for NoopRepairer {
//!     fn repair(&self, _cx: &Cx, _path: &SegmentPath) -> RepairAttempt {
//!         RepairAttempt::repaired()
//!     }
//! }
//!
//! let queue = Arc::new(MemoryRepairQueue::default());
//! queue.insert(InjuredSegment::new("bucket/object/s0"));
//!
//! let shutdown = Arc::new(ShutdownCoordinator::new());
//! shutdown.register_signals()?;
//!
//! let service = RepairService::new(
//!     RepairerConfig::default().with_env_overrides(),
//!     queue,
//!     Arc::new(MemoryIrreparableStore::new()),
//!     Arc::new(NoopRepairer),
//! )?;
//! let rt = asupersync::runtime::RuntimeBuilder::current_thread().build()?;
//! rt.block_on(service.run_with_shutdown(&shutdown))?;
//! shutdown.stop_signal_listener();
//! ```
//!
//! # Architecture
//!
//! ```text
//!  Cycle tick ─► acquire unit ─► job scope (total_timeout) ─► queue.select
//!                                      │                           │
//!                              deadline watcher            spawn repair job
//!                                                                  │
//!                        repairer.repair ─► classify ─► store / queue.delete
//!                                                                  │
//!                                                     drop: cancel Cx, release unit
//! ```
//!
//! ## Crate Layout
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | [`frankenrepair-core`](core) | Cancellation helpers, errors, data types, traits, config, metrics |
//! | [`frankenrepair-storage`](storage) | In-memory repair queue and irreparable store |
//! | [`frankenrepair-service`](service) | Limiter, poll cycle, job deadlines, jobs, shutdown, tracing setup |

pub use frankenrepair_core as core;
pub use frankenrepair_service as service;
pub use frankenrepair_storage as storage;

// Context and errors
pub use frankenrepair_core::{
    CANCEL_POLL_INTERVAL, CancelReason, Cx, RepairError, RepairResult, checkpoint, sleep_blocking,
};

// Configuration and metrics
pub use frankenrepair_core::{
    DurationStatSnapshot, RepairMetrics, RepairMetricsSnapshot, RepairerConfig,
    SegmentRepairerOptions,
};

// Data model and capabilities
pub use frankenrepair_core::{
    InjuredSegment, IrreparableDetail, IrreparableSegment, IrreparableStore, RepairAttempt,
    RepairFailure, RepairQueue, SegmentPath, SegmentRepairer,
};

// Service
pub use frankenrepair_service::{
    Cycle, FORCE_EXIT_WINDOW, JobLimiter, JobOutcome, JobPermit, JobReport, RepairService,
    ShutdownCoordinator, ShutdownReason, ShutdownState, Verbosity, init_subscriber,
};

// Reference backends
pub use frankenrepair_storage::{MemoryIrreparableStore, MemoryRepairQueue, RepairQueueConfig};

/// Everything needed to wire a repairer into a running service.
///
/// ```rust,ignore
/// use frankenrepair::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Cx, InjuredSegment, IrreparableDetail, IrreparableStore, RepairAttempt, RepairError,
        RepairFailure, RepairQueue, RepairResult, RepairService, RepairerConfig, SegmentPath,
        SegmentRepairer, ShutdownCoordinator, checkpoint, sleep_blocking,
    };
}
