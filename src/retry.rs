//! Bounded retry with exponential backoff
//!
//! One policy type shared by every call site that talks to something that
//! can be briefly unavailable: the model backend, `ffprobe` and video
//! decoders opening a file that is still being flushed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use crate::common::{FusionError, Result};

/// Retry policy with capped exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Factor applied to the delay after each failed attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 20_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed-delay policy: `attempts` tries spaced by `delay`
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts: attempts,
            initial_backoff_ms: ms,
            max_backoff_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Check that the policy can be executed
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(FusionError::config_error("retry max_attempts must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(FusionError::config_error(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `operation` until it succeeds, fails permanently or attempts run out
    ///
    /// `operation` receives the 1-based attempt number. Errors for which
    /// [`FusionError::is_retryable`] is false are returned immediately.
    pub fn run<T, F>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        self.run_if(label, operation, FusionError::is_retryable)
    }

    /// Like [`RetryPolicy::run`] with a caller-supplied retry predicate
    pub fn run_if<T, F, P>(&self, label: &str, mut operation: F, should_retry: P) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
        P: Fn(&FusionError) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}/{}", label, attempt, attempts);
                    }
                    return Ok(value);
                }
                Err(e) if attempt < attempts && should_retry(&e) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:.2}s",
                        label, attempt, attempts, e, delay.as_secs_f64()
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(9), Duration::from_millis(350));
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let calls = Cell::new(0);
        let result = quick(3).run("probe", |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 3 {
                Err(FusionError::Timeout { operation: "probe".into(), seconds: 5.0 })
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = quick(2).run("model", |_| {
            calls.set(calls.get() + 1);
            Err(FusionError::ModelRequest { message: "throttled".into(), retryable: true })
        });
        assert!(matches!(result, Err(FusionError::ModelRequest { .. })));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = quick(5).run("model", |_| {
            calls.set(calls.get() + 1);
            Err(FusionError::config_error("no backend"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { multiplier: 0.5, ..RetryPolicy::default() }.validate().is_err());
        assert_eq!(RetryPolicy::none().max_attempts, 1);
        assert_eq!(RetryPolicy::fixed(2, Duration::from_secs(2)).backoff_for(1), Duration::from_secs(2));
    }
}
