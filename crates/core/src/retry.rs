//! Generic attempt loop with linear/exponential/fixed backoff and jitter.
//!
//! Mirrors the shape of the teacher's `executor::retry` module (a
//! `Policy`-style enum plus a free `execute_with_retry` function) but
//! drives the delay formulas and named presets straight from the original
//! Python retry manager this spec was distilled from.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RetryStrategy {
    /// Constant delay between every attempt.
    Fixed,
    /// Delay grows linearly with attempt index.
    Linear,
    /// Delay grows geometrically with attempt index.
    Exponential,
}

/// Parameters governing one retry loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Hard cap on attempts (the first try plus retries).
    pub max_attempts: usize,
    /// Base delay used by every strategy.
    pub base_delay: Duration,
    /// Delay is never allowed to exceed this, post-jitter excluded.
    pub max_delay: Duration,
    /// Backoff shape.
    pub strategy: RetryStrategy,
    /// Multiplier used by the `Exponential` strategy.
    pub backoff_factor: f64,
    /// Whether to multiply the computed delay by a uniform factor in [0.8, 1.2].
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Preset used by `CallLifecycle::join`: up to 5 attempts, 2s base, exponential, capped at 30s.
    pub fn connection() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Preset used by the reconnect monitor: up to 3 attempts, 2s base, exponential.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Preset for generic stream-level retries: up to 3 attempts, linear backoff.
    pub fn stream() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            strategy: RetryStrategy::Linear,
            backoff_factor: 1.0,
            jitter: true,
        }
    }

    /// Delay between 0-indexed attempt `i` and `i+1`, before jitter.
    fn raw_delay_for(&self, attempt: usize) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Linear => self.base_delay * (attempt as u32 + 1),
            RetryStrategy::Exponential => {
                let millis = self.base_delay.as_secs_f64()
                    * self.backoff_factor.powi(attempt as i32)
                    * 1000.0;
                Duration::from_millis(millis.max(0.0) as u64)
            }
        }
    }

    /// Delay between 0-indexed attempt `i` and `i+1`, capped and jittered.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let capped = self.raw_delay_for(attempt).min(self.max_delay);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.8..=1.2);
            Duration::from_secs_f64(capped.as_secs_f64() * factor)
        } else {
            capped
        }
    }
}

/// Policy-parameterized loop that re-invokes a failing operation, keyed by
/// an identifier so concurrent callers don't share attempt counters.
#[derive(Debug, Default)]
pub struct RetryDriver {
    attempt_counts: DashMap<String, usize>,
}

impl RetryDriver {
    /// Construct an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current attempt count recorded for `operation_id` (0 if never attempted / already cleared).
    pub fn attempts_for(&self, operation_id: &str) -> usize {
        self.attempt_counts.get(operation_id).map(|v| *v).unwrap_or(0)
    }

    /// Run `op` under `config`, retrying on `Err` up to `config.max_attempts` times.
    ///
    /// Clears the identifier's counter on both success and final failure, so
    /// a later call under the same id starts fresh.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_id: &str,
        config: &RetryConfig,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            self.attempt_counts.insert(operation_id.to_string(), attempt + 1);
            match op().await {
                Ok(value) => {
                    self.attempt_counts.remove(operation_id);
                    return Ok(value);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= config.max_attempts {
                        self.attempt_counts.remove(operation_id);
                        warn!(operation_id, attempt, "retry budget exhausted");
                        return Err(Error::Timeout(format!(
                            "{operation_id} failed after {attempt} attempts: {err}"
                        )));
                    }
                    let delay = config.delay_for(attempt - 1);
                    debug!(operation_id, attempt, ?delay, %err, "retrying after failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn exponential_delay_matches_formula() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let cfg = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(cfg.delay_for(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_after_two_failures_with_exactly_three_invocations() {
        let driver = RetryDriver::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2.0,
            jitter: false,
        };
        let calls_clone = calls.clone();
        let result = driver
            .execute("op-1", &cfg, move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::Transport("transient".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(driver.attempts_for("op-1"), 0);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let driver = RetryDriver::new();
        let cfg = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            strategy: RetryStrategy::Fixed,
            backoff_factor: 1.0,
            jitter: false,
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<()> = driver
            .execute("op-2", &cfg, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Transport("always fails".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
