//! Retry combinator for protocol exchanges.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{Error, Result};

/// Delay between TK11 attempts.
pub const TK11_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Attempts per TK11 memory operation.
pub const TK11_MAX_ATTEMPTS: u32 = 3;

/// Fixed-delay retry policy.
///
/// The predicate decides which errors are worth another attempt; anything
/// else is returned straight away. The last error is surfaced once all
/// attempts are spent.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    retryable: fn(&Error) -> bool,
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts (at least one) separated by `delay`.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            retryable: Error::is_retryable,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// The TK11 memory-operation policy.
    pub fn tk11() -> Self {
        Self::new(TK11_MAX_ATTEMPTS, TK11_RETRY_DELAY)
    }

    /// Replace the retryability predicate.
    #[must_use]
    pub fn with_predicate(mut self, retryable: fn(&Error) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. `what` names the operation in log messages.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{what} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                },
                Err(e) if attempt < self.max_attempts && (self.retryable)(&e) => {
                    warn!(
                        "{what} failed (attempt {attempt}/{}): {e}",
                        self.max_attempts
                    );
                    thread::sleep(self.delay);
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}
