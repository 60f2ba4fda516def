//! Engine configuration types for Cadence.
//!
//! `EngineConfig` represents the `cadence.toml` that controls worker-pool
//! size, timeouts and the default retry shape. All fields have defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Default bound on a single committed unit output (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;

/// Top-level configuration for a workflow engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker-pool size; a hard bound on concurrent generation calls across
    /// every run of one engine. Defaults to the available parallelism.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Waves with fewer runnable units than this run sequentially.
    #[serde(default = "default_min_parallel_wave_size")]
    pub min_parallel_wave_size: usize,

    /// Per-unit bound (generation plus retries). `None` or 0 disables it.
    #[serde(default = "default_unit_timeout_ms")]
    pub unit_timeout_ms: Option<u64>,

    /// Per-wave bound. `None` or 0 disables it.
    #[serde(default = "default_wave_timeout_ms")]
    pub wave_timeout_ms: Option<u64>,

    /// Default delay shape; the attempt budget comes from each unit.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Outputs longer than this are truncated before being committed.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(1)
}

fn default_min_parallel_wave_size() -> usize {
    2
}

fn default_unit_timeout_ms() -> Option<u64> {
    Some(300_000)
}

fn default_wave_timeout_ms() -> Option<u64> {
    Some(1_800_000)
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_parallel_wave_size: default_min_parallel_wave_size(),
            unit_timeout_ms: default_unit_timeout_ms(),
            wave_timeout_ms: default_wave_timeout_ms(),
            retry: RetryPolicy::default(),
            event_capacity: default_event_capacity(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_min_parallel_wave_size(mut self, size: usize) -> Self {
        self.min_parallel_wave_size = size;
        self
    }

    pub fn with_unit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.unit_timeout_ms = timeout.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_wave_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wave_timeout_ms = timeout.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        positive_millis(self.unit_timeout_ms)
    }

    pub fn wave_timeout(&self) -> Option<Duration> {
        positive_millis(self.wave_timeout_ms)
    }
}

fn positive_millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}
