//! Retry policy configuration.
//!
//! A `RetryPolicy` describes how many times an operation may be attempted and
//! how long to wait between attempts. The retry executor in `cadence-core`
//! interprets it; this module only computes delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How an operation is retried.
///
/// Internally tagged by `type`:
/// ```yaml
/// retry:
///   type: exponential_backoff
///   initial_delay_ms: 500
///   multiplier: 2.0
///   max_delay_ms: 30000
///   max_attempts: 4
///   jitter_factor: 0.15
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Single attempt.
    NoRetry,
    /// Constant delay between attempts.
    FixedDelay { delay_ms: u64, max_attempts: u32 },
    /// `min(max_delay, initial_delay * multiplier^attempt)`, randomized by
    /// `±jitter_factor`.
    ExponentialBackoff {
        initial_delay_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        max_delay_ms: u64,
        max_attempts: u32,
        #[serde(default)]
        jitter_factor: f64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoff {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 3,
            jitter_factor: 0.15,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        RetryPolicy::FixedDelay {
            delay_ms: delay.as_millis() as u64,
            max_attempts,
        }
    }

    /// Total attempts allowed, including the first. Never less than 1.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::NoRetry => 1,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::ExponentialBackoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Same delay shape with a different attempt budget.
    ///
    /// `NoRetry` widened past one attempt becomes a zero-delay `FixedDelay`.
    pub fn with_max_attempts(&self, attempts: u32) -> Self {
        let attempts = attempts.max(1);
        match self {
            RetryPolicy::NoRetry if attempts == 1 => RetryPolicy::NoRetry,
            RetryPolicy::NoRetry => RetryPolicy::FixedDelay {
                delay_ms: 0,
                max_attempts: attempts,
            },
            RetryPolicy::FixedDelay { delay_ms, .. } => RetryPolicy::FixedDelay {
                delay_ms: *delay_ms,
                max_attempts: attempts,
            },
            RetryPolicy::ExponentialBackoff {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
                jitter_factor,
                ..
            } => RetryPolicy::ExponentialBackoff {
                initial_delay_ms: *initial_delay_ms,
                multiplier: *multiplier,
                max_delay_ms: *max_delay_ms,
                max_attempts: attempts,
                jitter_factor: *jitter_factor,
            },
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    ///
    /// `jitter_sample` is a uniform value in `[0, 1)`; it is mapped onto
    /// `[1 - jitter_factor, 1 + jitter_factor)`.
    pub fn delay_after(&self, attempt: u32, jitter_sample: f64) -> Duration {
        match self {
            RetryPolicy::NoRetry => Duration::ZERO,
            RetryPolicy::FixedDelay { delay_ms, .. } => Duration::from_millis(*delay_ms),
            RetryPolicy::ExponentialBackoff {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
                jitter_factor,
                ..
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let base = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                let capped = base.min(*max_delay_ms as f64);
                let jitter = jitter_factor.clamp(0.0, 1.0);
                let scale = 1.0 - jitter + 2.0 * jitter * jitter_sample.clamp(0.0, 1.0);
                Duration::from_micros(((capped * scale).max(0.0) * 1000.0).round() as u64)
            }
        }
    }
}
