//! Tracing names shared by all frankenrepair crates.
//!
//! Subscriber installation lives in `frankenrepair-service::tracing_setup`;
//! this module only pins the names so events, subscribers, and tests agree.
//!
//! ```text
//! FRANKENREPAIR_LOG=frankenrepair.job=debug,frankenrepair.queue=trace
//! ```

use tracing::Level;

/// Target prefix used by all frankenrepair tracing spans and events.
pub const TARGET_PREFIX: &str = "frankenrepair";

/// Event targets, one per component.
pub mod targets {
    /// Dispatch loop and service lifecycle.
    pub const SERVICE: &str = "frankenrepair.service";
    /// Per-segment repair jobs.
    pub const JOB: &str = "frankenrepair.job";
    /// Repair queue backends.
    pub const QUEUE: &str = "frankenrepair.queue";
    /// Irreparable record store backends.
    pub const IRREPARABLE: &str = "frankenrepair.irreparable";
    /// Poll cycle.
    pub const CYCLE: &str = "frankenrepair.cycle";
    /// Signal handling and drain.
    pub const SHUTDOWN: &str = "frankenrepair.shutdown";
}

/// Standard tracing span names.
pub mod span_names {
    /// One dispatch burst (`process_while_queue_has_items`).
    pub const DISPATCH_BURST: &str = "frankenrepair::dispatch_burst";
    /// One repair job, from permit hand-off to release.
    pub const REPAIR_JOB: &str = "frankenrepair::repair_job";
    /// One poll cycle tick.
    pub const CYCLE_TICK: &str = "frankenrepair::cycle_tick";
}

/// Standard structured field names used in tracing events.
pub mod field_names {
    pub const OP: &str = "op";
    pub const PATH: &str = "path";
    pub const OUTCOME: &str = "outcome";
    pub const ELAPSED_US: &str = "elapsed_us";
    pub const LOST_PIECES: &str = "lost_pieces";
    pub const IN_USE: &str = "in_use";
    pub const CAPACITY: &str = "capacity";
    pub const REASON: &str = "reason";
}

/// Parse a log level string (case-insensitive).
///
/// Recognized values: `trace`, `debug`, `info`, `warn`, `error`.
#[must_use]
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// `FRANKENREPAIR_LOG_LEVEL` if set and valid, otherwise `default`.
#[must_use]
pub fn level_from_env(default: Level) -> Level {
    level_from_var("FRANKENREPAIR_LOG_LEVEL", default)
}

fn level_from_var(key: &str, default: Level) -> Level {
    std::env::var(key)
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(default)
}
