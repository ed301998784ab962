//! # Retry Policy Module
//!
//! Linear backoff for throttled broker operations.
//!
//! A throttled send waits `attempts × backoff_base` before trying again and
//! gives up once `attempts` reaches `max_delivery_count`.

use async_trait::async_trait;
use std::time::Duration;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Retry policy configuration for linear backoff
///
/// # Examples
///
/// ```rust
/// use queue_transport::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 6 attempts, 10s base
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.calculate_delay(2), Duration::from_secs(20));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of throttled attempts before delivery is abandoned
    pub max_delivery_count: u32,

    /// Delay unit multiplied by the attempt count
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_count: 6,
            backoff_base: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_delivery_count: u32, backoff_base: Duration) -> Self {
        Self {
            max_delivery_count,
            backoff_base,
        }
    }

    /// Calculate delay after the given number of throttled attempts
    ///
    /// # Examples
    ///
    /// ```rust
    /// use queue_transport::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(6, Duration::from_secs(1));
    /// assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
    /// assert_eq!(policy.calculate_delay(3), Duration::from_secs(3));
    /// ```
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        self.backoff_base.saturating_mul(attempts)
    }

    /// Check if another attempt is allowed after `attempts` throttled attempts
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_delivery_count
    }
}

/// State tracker for one delivery; never shared across calls
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Throttled attempts so far
    pub attempts: u32,
}

impl RetryState {
    /// Create new retry state with no attempts recorded
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a throttled attempt and return the new count
    pub fn record_throttle(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Check if we can retry with this policy
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        policy.should_retry(self.attempts)
    }

    /// Get next delay from policy
    pub fn get_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.calculate_delay(self.attempts)
    }
}

/// Suspends the calling task for backoff periods
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
