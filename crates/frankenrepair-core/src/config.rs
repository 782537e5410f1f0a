//! Configuration for the repair dispatch service.
//!
//! [`RepairerConfig`] holds every knob. The service consumes `max_repair`,
//! `interval_ms`, and `total_timeout_ms`; the rest pass through untouched to
//! the segment repairer as [`SegmentRepairerOptions`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RepairError, RepairResult};

/// Configuration for the repair dispatch service.
///
/// # Environment Variable Overrides
///
/// | Variable                              | Field                                | Default     |
/// |----------------------------------------|--------------------------------------|-------------|
/// | `FRANKENREPAIR_MAX_REPAIR`             | `max_repair`                         | `5`         |
/// | `FRANKENREPAIR_INTERVAL_MS`            | `interval_ms`                        | `300000`    |
/// | `FRANKENREPAIR_TIMEOUT_MS`             | `timeout_ms`                         | `300000`    |
/// | `FRANKENREPAIR_DOWNLOAD_TIMEOUT_MS`    | `download_timeout_ms`                | `300000`    |
/// | `FRANKENREPAIR_TOTAL_TIMEOUT_MS`       | `total_timeout_ms`                   | `2700000`   |
/// | `FRANKENREPAIR_MAX_BUFFER_MEM`         | `max_buffer_mem`                     | `4194304`   |
/// | `FRANKENREPAIR_MAX_EXCESS_RATE`        | `max_excess_rate_optimal_threshold`  | `0.05`      |
/// | `FRANKENREPAIR_IN_MEMORY_REPAIR`       | `in_memory_repair`                   | `false`     |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairerConfig {
    /// Maximum concurrent repair jobs. Default: 5.
    pub max_repair: usize,

    /// Poll cycle period (ms). Default: 300000 (5 minutes).
    pub interval_ms: u64,

    /// Per-piece upload timeout (ms), passed to the repairer. Default: 300000.
    pub timeout_ms: u64,

    /// Per-piece download timeout (ms), passed to the repairer. Default: 300000.
    pub download_timeout_ms: u64,

    /// Wall-clock budget per job, measured from before the queue fetch (ms).
    /// Default: 2700000 (45 minutes).
    pub total_timeout_ms: u64,

    /// Upper bound on buffered segment bytes per repair. Default: 4 MiB.
    pub max_buffer_mem: u64,

    /// Ratio of extra pieces over the optimal threshold to upload.
    /// Default: 0.05.
    pub max_excess_rate_optimal_threshold: f64,

    /// Stage downloaded pieces in memory instead of temp files. Default: false.
    pub in_memory_repair: bool,
}

impl Default for RepairerConfig {
    fn default() -> Self {
        Self {
            max_repair: 5,
            interval_ms: 300_000,
            timeout_ms: 300_000,
            download_timeout_ms: 300_000,
            total_timeout_ms: 2_700_000,
            max_buffer_mem: 4 * 1024 * 1024,
            max_excess_rate_optimal_threshold: 0.05,
            in_memory_repair: false,
        }
    }
}

/// The subset of [`RepairerConfig`] the segment repairer consumes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentRepairerOptions {
    pub timeout: Duration,
    pub download_timeout: Duration,
    pub max_buffer_mem: u64,
    pub max_excess_rate_optimal_threshold: f64,
    pub in_memory_repair: bool,
}

impl RepairerConfig {
    /// Development defaults: one repair at a time, polled every minute.
    #[must_use]
    pub fn dev() -> Self {
        Self {
            max_repair: 1,
            interval_ms: 60_000,
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// [`RepairError::InvalidConfig`] on malformed TOML.
    pub fn from_toml_str(contents: &str) -> RepairResult<Self> {
        toml::from_str::<Self>(contents).map_err(|e| RepairError::InvalidConfig {
            field: "config".to_owned(),
            value: "<toml>".to_owned(),
            reason: e.to_string(),
        })
    }

    /// Read and parse a TOML config file.
    ///
    /// # Errors
    ///
    /// [`RepairError::Io`] if the file cannot be read,
    /// [`RepairError::InvalidConfig`] if it does not parse.
    pub fn load(path: &Path) -> RepairResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents).map_err(|err| match err {
            RepairError::InvalidConfig { reason, .. } => RepairError::InvalidConfig {
                field: "config".to_owned(),
                value: path.display().to_string(),
                reason,
            },
            other => other,
        })?;
        tracing::debug!(
            target: crate::tracing_config::targets::SERVICE,
            path = %path.display(),
            max_repair = config.max_repair,
            "loaded repairer config"
        );
        Ok(config)
    }

    /// Apply `FRANKENREPAIR_*` environment overrides.
    ///
    /// Only overrides fields whose variable is set. Unparseable values are
    /// ignored and the current value is kept.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = lookup("FRANKENREPAIR_MAX_REPAIR")
            && let Ok(n) = val.parse::<usize>()
        {
            self.max_repair = n;
        }
        if let Some(val) = lookup("FRANKENREPAIR_INTERVAL_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            self.interval_ms = ms;
        }
        if let Some(val) = lookup("FRANKENREPAIR_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            self.timeout_ms = ms;
        }
        if let Some(val) = lookup("FRANKENREPAIR_DOWNLOAD_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            self.download_timeout_ms = ms;
        }
        if let Some(val) = lookup("FRANKENREPAIR_TOTAL_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            self.total_timeout_ms = ms;
        }
        if let Some(val) = lookup("FRANKENREPAIR_MAX_BUFFER_MEM")
            && let Ok(bytes) = val.parse::<u64>()
        {
            self.max_buffer_mem = bytes;
        }
        if let Some(val) = lookup("FRANKENREPAIR_MAX_EXCESS_RATE")
            && let Ok(rate) = val.parse::<f64>()
            && rate.is_finite()
            && rate >= 0.0
        {
            self.max_excess_rate_optimal_threshold = rate;
        }
        if let Some(val) = lookup("FRANKENREPAIR_IN_MEMORY_REPAIR") {
            self.in_memory_repair = val == "true" || val == "1";
        }
        self
    }

    /// Reject values the service cannot run with.
    ///
    /// # Errors
    ///
    /// [`RepairError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> RepairResult<()> {
        if self.max_repair == 0 {
            return Err(invalid("max_repair", self.max_repair, "must be at least 1"));
        }
        for (field, ms) in [
            ("interval_ms", self.interval_ms),
            ("timeout_ms", self.timeout_ms),
            ("download_timeout_ms", self.download_timeout_ms),
            ("total_timeout_ms", self.total_timeout_ms),
        ] {
            if ms == 0 {
                return Err(invalid(field, ms, "must be greater than zero"));
            }
        }
        let rate = self.max_excess_rate_optimal_threshold;
        if !rate.is_finite() || rate < 0.0 {
            return Err(invalid(
                "max_excess_rate_optimal_threshold",
                rate,
                "must be a finite, non-negative ratio",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    /// Options handed to the segment repairer unchanged.
    #[must_use]
    pub const fn segment_repairer_options(&self) -> SegmentRepairerOptions {
        SegmentRepairerOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            download_timeout: Duration::from_millis(self.download_timeout_ms),
            max_buffer_mem: self.max_buffer_mem,
            max_excess_rate_optimal_threshold: self.max_excess_rate_optimal_threshold,
            in_memory_repair: self.in_memory_repair,
        }
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> RepairError {
    RepairError::InvalidConfig {
        field: field.to_owned(),
        value: value.to_string(),
        reason: reason.to_owned(),
    }
}
