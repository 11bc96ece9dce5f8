//! Retry policy for callback task runs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on attempts for any callback task run
pub const MAX_ATTEMPTS: u32 = 3;

/// Attempt limit and fixed wait for PENDING callback runs
///
/// The effective attempt limit never exceeds [`MAX_ATTEMPTS`], whatever the
/// configured value says.
///
/// # Example
///
/// ```
/// use jobguard_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_secs(30), 10);
///
/// assert_eq!(policy.effective_max_attempts(), 3);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first call
    pub max_attempts: u32,

    /// Wait before each retry
    #[serde(with = "crate::duration_millis")]
    pub wait: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, eligible again immediately
    fn default() -> Self {
        Self::fixed(Duration::ZERO, MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    pub fn fixed(wait: Duration, max_attempts: u32) -> Self {
        Self { max_attempts, wait }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Attempt limit after applying the [`MAX_ATTEMPTS`] ceiling
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.clamp(1, MAX_ATTEMPTS)
    }

    /// Wait before the given attempt (1-based); the first attempt never waits
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.wait
        }
    }
}
