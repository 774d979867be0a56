//! Retry policy and dead letter entries.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};

/// How often a failing job is retried before it is dead-lettered.
///
/// Failed jobs are requeued immediately; there is no backoff delay since a
/// worker only holds one message at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before dead-lettering. `None` requeues forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Requeue failing jobs forever.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// Dead-letter a job once it has failed `max_attempts` times.
    #[must_use]
    pub const fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    /// Check if a job that just failed on `attempt` (1-based) should be retried.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Dead letter queue entry for a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// Raw job body.
    pub body: Vec<u8>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error message.
    pub last_error: String,
    /// Timestamp of last failure.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Create a new dead letter entry.
    #[must_use]
    pub fn new(body: Vec<u8>, attempts: u32, error: String) -> Self {
        Self {
            body,
            attempts,
            last_error: error,
            failed_at: Utc::now(),
        }
    }
}
