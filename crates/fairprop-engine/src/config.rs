//! Engine configuration: scheduler and latency monitor knobs.
//!
//! Every field has a default, so an empty JSON object is a valid config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fairprop_core::TruncationPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Scheduler and serving configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on requests grouped into one forward pass.
    pub max_batch_size: usize,
    /// How long the scheduler holds a request to accumulate a batch.
    pub micro_window_ms: u64,
    /// Queued requests beyond this are rejected with backpressure.
    pub queue_capacity: usize,
    /// Execution allowance added to the micro-window to form each request's deadline.
    pub execution_timeout_ms: u64,
    /// Forward passes allowed to run at once.
    pub max_concurrent_batches: usize,
    pub batching_enabled: bool,
    pub truncation: TruncationPolicy,
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            micro_window_ms: 2,
            queue_capacity: 256,
            execution_timeout_ms: 50,
            max_concurrent_batches: 2,
            batching_enabled: true,
            truncation: TruncationPolicy::Head,
            monitor: MonitorConfig::default(),
        }
    }
}

/// Latency monitor / circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Per-call latency ceiling.
    pub latency_budget_ms: u64,
    /// Number of recent calls in the rolling window.
    pub window_size: usize,
    /// Calls required in the window before the breaker may trip.
    pub min_samples: usize,
    /// Fraction of over-budget calls in the window that trips DEGRADED.
    pub trip_fraction: f64,
    /// Violation-free interval before DEGRADED starts probing.
    pub cooldown_ms: u64,
    /// Consecutive in-budget calls that restore HEALTHY.
    pub recovery_calls: u32,
    /// Share of RECOVERING traffic allowed to batch normally.
    pub probe_fraction: f64,
    /// Window cap applied to requests served degraded.
    pub degraded_max_sequence_length: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: 20,
            window_size: 50,
            min_samples: 10,
            trip_fraction: 0.2,
            cooldown_ms: 5_000,
            recovery_calls: 100,
            probe_fraction: 0.1,
            degraded_max_sequence_length: 128,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_batch_size", self.max_batch_size),
            ("queue_capacity", self.queue_capacity),
            ("max_concurrent_batches", self.max_concurrent_batches),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(invalid(format!("{name} must be > 0")));
            }
        }
        self.monitor.validate()
    }

    pub fn micro_window(&self) -> Duration {
        Duration::from_millis(self.micro_window_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Implicit per-request deadline measured from enqueue.
    pub fn request_budget(&self) -> Duration {
        self.micro_window() + self.execution_timeout()
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency_budget_ms == 0 {
            return Err(invalid("monitor.latency_budget_ms must be > 0"));
        }
        if self.window_size == 0 {
            return Err(invalid("monitor.window_size must be > 0"));
        }
        if self.min_samples == 0 || self.min_samples > self.window_size {
            return Err(invalid(format!(
                "monitor.min_samples must be in 1..={}",
                self.window_size
            )));
        }
        if !(self.trip_fraction > 0.0 && self.trip_fraction < 1.0) {
            return Err(invalid("monitor.trip_fraction must be in (0, 1)"));
        }
        if !(self.probe_fraction > 0.0 && self.probe_fraction <= 1.0) {
            return Err(invalid("monitor.probe_fraction must be in (0, 1]"));
        }
        if self.recovery_calls == 0 {
            return Err(invalid("monitor.recovery_calls must be > 0"));
        }
        if self.degraded_max_sequence_length < 2 {
            return Err(invalid("monitor.degraded_max_sequence_length must be >= 2"));
        }
        Ok(())
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Every n-th RECOVERING request is a probe.
    pub fn probe_interval(&self) -> u64 {
        (1.0 / self.probe_fraction).round().max(1.0) as u64
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
