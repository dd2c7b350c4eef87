//! Backoff helpers.
//!
//! [`retry_with_backoff`] wraps one-off startup calls (connecting to the
//! coordination store, binding listeners) that may fail transiently.
//! [`BackoffTracker`] remembers consecutive reconcile failures per FLApp so
//! the controller's error policy can requeue with a growing delay.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Exponential backoff parameters
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay before retrying after `failures` consecutive failures, without jitter
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Scale a delay by a random factor in `[0.5, 1.5)`, capped at `max`
fn jittered(delay: Duration, max: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).min(max.as_secs_f64()))
}

/// Execute an async operation until it succeeds or `max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        let delay = jittered(config.delay_for(attempt), config.max_delay);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Per-key consecutive failure counter for reconcile requeues
///
/// Keys are `namespace/name` of the failing object. A successful pass resets
/// the key.
#[derive(Debug)]
pub struct BackoffTracker {
    config: RetryConfig,
    failures: DashMap<String, u32>,
}

impl BackoffTracker {
    /// Create a tracker starting at `initial` and capped at `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            config: RetryConfig {
                max_attempts: 0,
                initial_delay: initial,
                max_delay: max,
                backoff_multiplier: 2.0,
            },
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return the delay before the next attempt
    pub fn next_delay(&self, key: &str) -> Duration {
        let failures = {
            let mut entry = self.failures.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        jittered(self.config.delay_for(failures), self.config.max_delay)
    }

    /// Forget failures recorded for `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }
}
