//! Bounded exponential backoff for failed batch writes.
//!
//! A batch that fails its initial write is handed to the retry path with
//! `attempt = 0`. Each retry sleeps `base_delay * 2^attempt` before
//! re-attempting the same write; once `attempt` reaches `max_retries`
//! the batch is dropped and its length is counted against the drop
//! statistic. Retries for distinct batches are scheduled independently.

use std::time::Duration;

use serde_json::Value;

/// Default number of retries after the initial write attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Backoff schedule for failed batch writes.
///
/// # Example
///
/// ```
/// use popmetrics_analytics::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
/// assert!(policy.is_exhausted(3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles with each further attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with explicit bounds.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// Saturates instead of overflowing, though with any sane retry
    /// bound the schedule never gets near that.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }

    /// True once a batch has used up its retry budget.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        )
    }
}

/// One store-bound group of records moving through the retry machinery.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Target store for the whole batch.
    pub store: String,
    /// Records in collection order.
    pub records: Vec<Value>,
    /// Zero-based retry attempt; `0` means first retry after the
    /// failed initial write.
    pub attempt: u32,
}

impl BatchJob {
    /// Wraps a failed write for its first retry.
    #[must_use]
    pub fn new(store: impl Into<String>, records: Vec<Value>) -> Self {
        Self {
            store: store.into(),
            records,
            attempt: 0,
        }
    }

    /// The same batch, advanced to the next retry attempt.
    #[must_use]
    pub fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }

    /// Number of records carried by the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the batch carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
