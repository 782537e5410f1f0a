//! Tracing subscriber initialization for processes hosting the repair service.
//!
//! # Priority (highest to lowest)
//!
//! 1. `FRANKENREPAIR_LOG` env var (per-target directives, e.g. `frankenrepair.job=debug,warn`)
//! 2. `RUST_LOG` env var
//! 3. `verbosity` (`Verbose` → debug for frankenrepair targets, `Quiet` → error)
//! 4. `FRANKENREPAIR_LOG_LEVEL`, else `warn`

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use frankenrepair_core::tracing_config;
use frankenrepair_core::{RepairError, RepairResult};

/// Output verbosity chosen by the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Only errors.
    Quiet,
    /// Warnings and above.
    Normal,
    /// Debug-level output.
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are set.
    #[must_use]
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    #[must_use]
    pub fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => tracing_config::level_from_env(Level::WARN),
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global tracing subscriber writing to stderr.
///
/// # Errors
///
/// Returns [`RepairError::SubsystemError`] if a global subscriber is already
/// installed.
pub fn init_subscriber(verbosity: Verbosity, no_color: bool) -> RepairResult<()> {
    let filter = build_env_filter(verbosity);

    let stderr_is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let use_ansi = !no_color && stderr_is_tty;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(true)
        .with_thread_names(true)
        .with_level(true);

    let result = if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.with_timer(fmt::time::uptime()))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.without_time().compact())
            .try_init()
    };
    result.map_err(|error| RepairError::subsystem("tracing", error))
}

fn build_env_filter(verbosity: Verbosity) -> EnvFilter {
    build_env_filter_from(std::env::var("FRANKENREPAIR_LOG").ok(), verbosity)
}

fn build_env_filter_from(project_directives: Option<String>, verbosity: Verbosity) -> EnvFilter {
    // Unparseable directives fall through rather than failing startup.
    if let Some(directives) = project_directives
        && let Ok(filter) = EnvFilter::try_new(&directives)
    {
        return filter;
    }

    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = verbosity.default_level();
    let directive = if verbosity == Verbosity::Verbose {
        format!(
            "{level},{prefix}=debug",
            prefix = tracing_config::TARGET_PREFIX,
        )
    } else {
        level.to_string()
    };

    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
