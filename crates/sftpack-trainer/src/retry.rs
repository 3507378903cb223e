//! Bounded retries for dataset and checkpoint I/O.

use std::time::Duration;

use sftpack_core::{Result, SftPackError};
use tracing::warn;

/// Default delay unit between attempts; attempt `n` waits `n` units.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

/// Retry policy for blocking I/O collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: usize,
    /// Linear back-off unit.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Policy with `retries` retries and the default back-off.
    pub fn new(retries: usize) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    /// Set the back-off unit.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Non-retryable errors are returned unchanged. Exhausted retries yield
    /// [`SftPackError::Resource`] carrying the last failure.
    pub fn run<T>(&self, operation: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= attempts => {
                    return Err(SftPackError::Resource {
                        operation: operation.to_string(),
                        attempts,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.backoff * attempt as u32;
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "I/O failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
