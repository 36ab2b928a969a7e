//! Exponential retry timeouts
//!
//! [`RetryTimeoutStrategy`] hands out a growing sequence of timeouts:
//!
//! ```text
//! min=2ms max=30ms:  2 ──► 4 ──► 8 ──► 16 ──► 30 ──► 30 ...
//!                    reset() ──► back to 2
//! ```
//!
//! It is a plain value: no clock, no sleeping. Owners decide when to wait.

use crate::error::{Result, VirtaError};
use std::time::Duration;

/// First non-zero timeout when growing from a zero minimum
pub const ZERO_TIMEOUT_FLOOR: Duration = Duration::from_millis(100);

/// Doubling timeout sequence bounded by `[min_timeout, max_timeout]`
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use virta::retry::RetryTimeoutStrategy;
///
/// let mut strategy =
///     RetryTimeoutStrategy::new(Duration::from_millis(2), Duration::from_millis(30)).unwrap();
/// assert_eq!(strategy.next(), Duration::from_millis(2));
/// assert_eq!(strategy.next(), Duration::from_millis(4));
/// assert_eq!(strategy.tries_since_reset(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTimeoutStrategy {
    min_timeout: Duration,
    max_timeout: Duration,
    current_timeout: Duration,
    tries_since_reset: u32,
}

impl RetryTimeoutStrategy {
    /// Create a strategy starting at `min_timeout`
    ///
    /// Fails with [`VirtaError::InvalidConfiguration`] when `min_timeout > max_timeout`.
    pub fn new(min_timeout: Duration, max_timeout: Duration) -> Result<Self> {
        if min_timeout > max_timeout {
            return Err(VirtaError::InvalidConfiguration(format!(
                "min timeout {min_timeout:?} exceeds max timeout {max_timeout:?}"
            )));
        }

        Ok(Self {
            min_timeout,
            max_timeout,
            current_timeout: min_timeout,
            tries_since_reset: 0,
        })
    }

    /// Return the current timeout and advance to the next one
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Duration {
        let timeout = self.current_timeout;
        let grown = if timeout.is_zero() {
            ZERO_TIMEOUT_FLOOR
        } else {
            timeout.saturating_mul(2)
        };
        self.current_timeout = grown.min(self.max_timeout);
        self.tries_since_reset = self.tries_since_reset.saturating_add(1);
        timeout
    }

    /// Timeout the next call to [`next`](Self::next) will return
    pub fn current(&self) -> Duration {
        self.current_timeout
    }

    /// Number of [`next`](Self::next) calls since construction or the last reset
    pub fn tries_since_reset(&self) -> u32 {
        self.tries_since_reset
    }

    /// Go back to `min_timeout`
    pub fn reset(&mut self) {
        self.current_timeout = self.min_timeout;
        self.tries_since_reset = 0;
    }

    pub fn min_timeout(&self) -> Duration {
        self.min_timeout
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }
}
