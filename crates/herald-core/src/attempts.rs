//! Delivery attempt records and their subscribers.
//!
//! The delivery engine emits exactly one [`AttemptRecord`] per HTTP attempt,
//! whatever the outcome, to an [`AttemptHandler`]. Handlers never feed back
//! into delivery: a slow or failing subscriber cannot change a task's state.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::TaskId;

/// What the receiver (or the network) did with one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Receiver answered with a 2xx status.
    Delivered {
        /// HTTP status code.
        status_code: u16,
    },

    /// Receiver answered with a non-2xx status.
    Rejected {
        /// HTTP status code.
        status_code: u16,
        /// Response body, truncated by the client.
        body: String,
    },

    /// No response: timeout, connection failure, or a local error.
    Errored {
        /// Human-readable description.
        message: String,
        /// Error category label, e.g. `timeout` or `network`.
        category: String,
    },
}

impl AttemptOutcome {
    /// Returns true for a 2xx response.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Status code, if the receiver answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Delivered { status_code } | Self::Rejected { status_code, .. } => {
                Some(*status_code)
            },
            Self::Errored { .. } => None,
        }
    }

    /// Error description for failed attempts.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Delivered { .. } => None,
            Self::Rejected { status_code, body } if body.is_empty() => {
                Some(format!("HTTP {status_code}"))
            },
            Self::Rejected { status_code, body } => Some(format!("HTTP {status_code}: {body}")),
            Self::Errored { message, .. } => Some(message.clone()),
        }
    }
}

/// State the task was moved to after the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptDisposition {
    /// Task marked `succeeded`.
    Succeeded,

    /// Task left `pending` with a new `next_attempt_at`.
    RetryScheduled {
        /// When the task becomes claimable again.
        next_attempt_at: DateTime<Utc>,
        /// Delay that was applied.
        backoff: Duration,
    },

    /// Task marked `dead`.
    Dead,
}

/// Structured record of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Task that was attempted.
    pub task_id: TaskId,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// Destination URL.
    pub target_url: String,

    /// Response classification.
    pub outcome: AttemptOutcome,

    /// Wall time spent on the HTTP call.
    pub duration: Duration,

    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,

    /// Resulting task state.
    pub disposition: AttemptDisposition,
}

impl AttemptRecord {
    /// Duration in whole milliseconds, saturating.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Next retry time if one was scheduled.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match &self.disposition {
            AttemptDisposition::RetryScheduled { next_attempt_at, .. } => Some(*next_attempt_at),
            AttemptDisposition::Succeeded | AttemptDisposition::Dead => None,
        }
    }
}

/// Subscriber for attempt records.
///
/// Implementations must not block delivery for long and must swallow their
/// own failures.
#[async_trait::async_trait]
pub trait AttemptHandler: Send + Sync + std::fmt::Debug {
    /// Handles one attempt record.
    async fn handle_attempt(&self, record: AttemptRecord);
}

/// Handler that discards every record.
#[derive(Debug, Default)]
pub struct NoOpAttemptHandler;

impl NoOpAttemptHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AttemptHandler for NoOpAttemptHandler {
    async fn handle_attempt(&self, _record: AttemptRecord) {}
}

/// Forwards each record to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastAttemptHandler {
    handlers: Vec<Arc<dyn AttemptHandler>>,
}

impl MulticastAttemptHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn AttemptHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl AttemptHandler for MulticastAttemptHandler {
    async fn handle_attempt(&self, record: AttemptRecord) {
        let deliveries = self.handlers.iter().map(|handler| {
            let record = record.clone();
            async move { handler.handle_attempt(record).await }
        });

        futures::future::join_all(deliveries).await;
    }
}
