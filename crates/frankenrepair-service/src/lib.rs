//! Repair dispatch service for frankenrepair.
//!
//! [`RepairService`] drives a [`Cycle`] that pulls injured segments from a
//! repair queue and runs each repair on its own thread, bounded by a
//! [`JobLimiter`]. [`ShutdownCoordinator`] turns process signals into root
//! context cancellation.

pub mod cycle;
mod inflight;
pub mod limiter;
pub mod service;
pub mod shutdown;
pub mod tracing_setup;
pub mod worker;

pub use cycle::Cycle;
pub use limiter::{JobLimiter, JobPermit};
pub use service::RepairService;
pub use shutdown::{FORCE_EXIT_WINDOW, ShutdownCoordinator, ShutdownReason, ShutdownState};
pub use tracing_setup::{Verbosity, init_subscriber};
pub use worker::{JobOutcome, JobReport};
