//! Structured logging of delivery attempts.

use herald_core::{AttemptDisposition, AttemptHandler, AttemptOutcome, AttemptRecord};
use tracing::{error, info, warn};

/// Writes one `tracing` event per attempt record.
///
/// Delivered attempts log at `info`, scheduled retries at `warn`, and
/// dead-lettered tasks at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAttemptHandler;

impl LoggingAttemptHandler {
    /// Creates a new logging handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AttemptHandler for LoggingAttemptHandler {
    async fn handle_attempt(&self, record: AttemptRecord) {
        let status_code = record.outcome.status_code();
        let error_message = record.outcome.error_message();
        let category = match &record.outcome {
            AttemptOutcome::Errored { category, .. } => Some(category.as_str()),
            AttemptOutcome::Delivered { .. } | AttemptOutcome::Rejected { .. } => None,
        };

        match &record.disposition {
            AttemptDisposition::Succeeded => {
                info!(
                    task_id = %record.task_id,
                    attempt_number = record.attempt_number,
                    target_url = %record.target_url,
                    status_code,
                    duration_ms = record.duration_ms(),
                    "webhook delivered successfully"
                );
            },
            AttemptDisposition::RetryScheduled { next_attempt_at, backoff } => {
                warn!(
                    task_id = %record.task_id,
                    attempt_number = record.attempt_number,
                    target_url = %record.target_url,
                    status_code,
                    error = error_message.as_deref(),
                    category,
                    duration_ms = record.duration_ms(),
                    next_attempt_at = %next_attempt_at,
                    backoff_seconds = backoff.as_secs(),
                    "delivery failed, retry scheduled"
                );
            },
            AttemptDisposition::Dead => {
                error!(
                    task_id = %record.task_id,
                    attempt_number = record.attempt_number,
                    target_url = %record.target_url,
                    status_code,
                    error = error_message.as_deref(),
                    category,
                    duration_ms = record.duration_ms(),
                    "delivery failed permanently, task dead-lettered"
                );
            },
        }
    }
}
