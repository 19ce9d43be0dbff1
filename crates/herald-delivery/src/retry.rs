//! Exponential backoff and the dead-letter ceiling.
//!
//! A failed attempt `n` is retried after exactly `2^n` seconds, with no
//! jitter, until `n` reaches `max_attempts`. The shift saturates and the
//! resulting timestamp is clamped, so absurd attempt numbers cannot overflow.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry policy applied to every failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,

    /// Optional upper bound on a single backoff. `None` keeps the pure
    /// `2^n` schedule.
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: crate::DEFAULT_MAX_ATTEMPTS, max_backoff: None }
    }
}

/// What to do with a task after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the task pending and try again later.
    Retry {
        /// When the task becomes claimable again
        next_attempt_at: DateTime<Utc>,
        /// Delay applied after the failed attempt
        backoff: Duration,
    },
    /// Attempt ceiling reached; dead-letter the task.
    GiveUp,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt ceiling and no backoff cap.
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts, ..Self::default() }
    }

    /// Caps every backoff at `max_backoff`.
    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    /// Delay after failed attempt `attempt_number`: `2^attempt_number`
    /// seconds, saturating, then capped.
    pub fn backoff_for(&self, attempt_number: u32) -> Duration {
        let seconds = 1_u64.checked_shl(attempt_number).unwrap_or(u64::MAX);
        let backoff = Duration::from_secs(seconds);

        match self.max_backoff {
            Some(cap) => backoff.min(cap),
            None => backoff,
        }
    }

    /// Decides whether failed attempt `attempt_number` is retried.
    pub fn decide(&self, attempt_number: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let backoff = self.backoff_for(attempt_number);
        let next_attempt_at = chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|delay| failed_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry { next_attempt_at, backoff }
    }
}
