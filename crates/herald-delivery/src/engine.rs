//! Delivery engine: one attempt per claimed task.
//!
//! The engine owns no task state. It claims a batch through the
//! [`DeliveryStorage`] seam, delivers every task in the batch concurrently,
//! and routes each resulting state change back through the store. Dispatch
//! loops call [`DeliveryEngine::fetch_and_process_batch`] on a timer.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use herald_core::{
    models::{DeliveryTask, TaskStatus},
    storage::Storage,
    AttemptDisposition, AttemptHandler, AttemptOutcome, AttemptRecord, Clock, PayloadSigner,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::{
    attempt_log::LoggingAttemptHandler,
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetryPolicy},
    storage::{DeliveryStorage, PostgresDeliveryStorage},
};

/// Configuration for the delivery engine and its dispatch loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of dispatch loops run by the worker pool.
    pub worker_count: usize,

    /// Maximum tasks to claim per cycle.
    pub batch_size: usize,

    /// Interval between the starts of consecutive cycles.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff schedule and attempt ceiling.
    pub retry_policy: RetryPolicy,

    /// How long a claimed task stays invisible to other claimers. Must
    /// exceed the HTTP timeout.
    pub claim_lease: Duration,

    /// Maximum time to wait for dispatch loops to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            claim_lease: Duration::from_secs(crate::DEFAULT_CLAIM_LEASE_SECONDS),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for zero sizes or
    /// intervals, or a claim lease that does not exceed the HTTP timeout.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("poll_interval must be greater than zero"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if self.claim_lease <= self.client_config.timeout {
            return Err(DeliveryError::configuration(format!(
                "claim lease ({:?}) must exceed the HTTP timeout ({:?})",
                self.claim_lease, self.client_config.timeout
            )));
        }
        Ok(())
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running dispatch loops.
    pub active_workers: usize,
    /// Claim cycles completed.
    pub batches: u64,
    /// Attempts completed, whatever the outcome.
    pub tasks_processed: u64,
    /// Tasks marked `succeeded`.
    pub succeeded: u64,
    /// Failed attempts rescheduled.
    pub retries_scheduled: u64,
    /// Tasks marked `dead`.
    pub dead_lettered: u64,
    /// Attempts currently running.
    pub in_flight: u64,
}

/// Delivers claimed tasks and records their outcome.
///
/// Shared by every dispatch loop in the process via `Arc`.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    signer: PayloadSigner,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    attempt_handler: Arc<dyn AttemptHandler>,
}

impl DeliveryEngine {
    /// Creates an engine that logs attempt records.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid or the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        signer: PayloadSigner,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_attempt_handler(storage, signer, config, clock, Arc::new(LoggingAttemptHandler))
    }

    /// Creates an engine that sends attempt records to `attempt_handler`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid or the HTTP client cannot be built.
    pub fn with_attempt_handler(
        storage: Arc<dyn DeliveryStorage>,
        signer: PayloadSigner,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        attempt_handler: Arc<dyn AttemptHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let client = DeliveryClient::new(config.client_config.clone())?;

        Ok(Self {
            storage,
            client,
            signer,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock,
            attempt_handler,
        })
    }

    /// Creates a production engine over the PostgreSQL task store.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid or the HTTP client cannot be built.
    pub fn with_postgres(
        storage: Arc<Storage>,
        signer: PayloadSigner,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let delivery_storage: Arc<dyn DeliveryStorage> =
            Arc::new(PostgresDeliveryStorage::new(storage, config.claim_lease));
        Self::new(delivery_storage, signer, config, clock)
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Returns a snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    pub(crate) async fn set_active_workers(&self, count: usize) {
        self.stats.write().await.active_workers = count;
    }

    /// Claims up to `batch_size` due tasks and delivers them concurrently.
    ///
    /// Returns the number of tasks claimed; 0 means the queue had nothing
    /// due. A failure while delivering one task is logged and does not
    /// affect the others.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the claim fails.
    pub async fn fetch_and_process_batch(&self) -> Result<usize> {
        let tasks = self.storage.claim_batch(self.config.batch_size).await.map_err(|e| {
            DeliveryError::database(format!("failed to claim due tasks: {e}"))
        })?;
        let claimed = tasks.len();

        debug!(claimed_count = claimed, "claimed delivery tasks");

        let deliveries = tasks.into_iter().map(|task| async move {
            let task_id = task.id;
            if let Err(error) = self.deliver_task(task).await {
                error!(task_id = %task_id, error = %error, "task delivery failed");
            }
        });
        join_all(deliveries).await;

        self.stats.write().await.batches += 1;

        Ok(claimed)
    }

    /// Makes one delivery attempt and records its outcome.
    ///
    /// Any HTTP status is a normal response: 2xx marks the task
    /// `succeeded`; anything else, a timeout, or a connection error
    /// reschedules it after `2^attempt_number` seconds, or marks it `dead`
    /// once the attempt ceiling is reached. One [`AttemptRecord`] is
    /// emitted after the store accepts the transition.
    ///
    /// # Errors
    ///
    /// Returns `StaleTask` if the task is not pending or the store's guard
    /// rejects the transition, `SigningError` if the body cannot be
    /// serialized, and `DatabaseError` if the store write fails. A store
    /// error names the HTTP outcome it failed to record. In each case the
    /// task is left for its lease to expire.
    pub async fn deliver_task(&self, task: DeliveryTask) -> Result<AttemptRecord> {
        if task.status != TaskStatus::Pending {
            return Err(DeliveryError::StaleTask {
                message: format!("task {} is {}", task.id, task.status),
            });
        }

        self.stats.write().await.in_flight += 1;
        let result = self.attempt(&task).await;
        {
            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            if result.is_ok() {
                stats.tasks_processed += 1;
            }
        }

        let record = result?;
        self.attempt_handler.handle_attempt(record.clone()).await;
        Ok(record)
    }

    async fn attempt(&self, task: &DeliveryTask) -> Result<AttemptRecord> {
        let attempt_number = task.next_attempt_number();
        let signed = self
            .signer
            .sign(&task.outbound_payload())
            .map_err(|e| DeliveryError::signing(e.to_string()))?;

        let request = DeliveryRequest {
            task_id: task.id,
            url: task.target_url.clone(),
            body: signed.body,
            signature: signed.signature,
            attempt_number,
        };

        let attempted_at = self.clock.now_utc();
        let started = self.clock.now();
        let outcome = match self.client.deliver(request).await {
            Ok(response) if response.is_success => {
                AttemptOutcome::Delivered { status_code: response.status_code }
            },
            Ok(response) => {
                debug!(
                    task_id = %task.id,
                    status_code = response.status_code,
                    "receiver rejected delivery"
                );
                AttemptOutcome::Rejected { status_code: response.status_code, body: response.body }
            },
            Err(error) => AttemptOutcome::Errored {
                message: error.to_string(),
                category: error.category().to_string(),
            },
        };
        let duration = self.clock.now().saturating_duration_since(started);

        let disposition = match self.record_outcome(task, attempt_number, &outcome).await {
            Ok(disposition) => disposition,
            Err(error) => {
                let summary = describe_outcome(&outcome);
                error!(
                    task_id = %task.id,
                    attempt_number,
                    status_code = outcome.status_code(),
                    outcome = %summary,
                    duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "attempt outcome could not be recorded"
                );
                return Err(error.with_context(format!(
                    "attempt {attempt_number} ended with {summary} in {}ms",
                    duration.as_millis()
                )));
            },
        };

        Ok(AttemptRecord {
            task_id: task.id,
            attempt_number,
            target_url: task.target_url.clone(),
            outcome,
            duration,
            attempted_at,
            disposition,
        })
    }

    async fn record_outcome(
        &self,
        task: &DeliveryTask,
        attempt_number: u32,
        outcome: &AttemptOutcome,
    ) -> Result<AttemptDisposition> {
        if outcome.is_success() {
            self.storage.mark_succeeded(task.id, attempt_number).await?;
            self.stats.write().await.succeeded += 1;
            return Ok(AttemptDisposition::Succeeded);
        }

        match self.config.retry_policy.decide(attempt_number, self.clock.now_utc()) {
            RetryDecision::Retry { next_attempt_at, backoff } => {
                self.storage.mark_failed(task.id, attempt_number, next_attempt_at).await?;
                self.stats.write().await.retries_scheduled += 1;
                Ok(AttemptDisposition::RetryScheduled { next_attempt_at, backoff })
            },
            RetryDecision::GiveUp => {
                self.storage.mark_dead(task.id, attempt_number).await?;
                self.stats.write().await.dead_lettered += 1;
                Ok(AttemptDisposition::Dead)
            },
        }
    }
}

fn describe_outcome(outcome: &AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Delivered { status_code } => format!("HTTP {status_code}"),
        other => other.error_message().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use herald_core::{TestClock, DEVELOPMENT_SECRET};

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    fn engine_with(config: DeliveryConfig) -> Result<DeliveryEngine> {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let storage = Arc::new(MockDeliveryStorage::new(clock.clone()));
        DeliveryEngine::new(storage, PayloadSigner::new(DEVELOPMENT_SECRET).unwrap(), config, clock)
    }

    #[test]
    fn default_config_is_valid() {
        assert!(DeliveryConfig::default().validate().is_ok());
    }

    #[test]
    fn lease_must_exceed_http_timeout() {
        let config = DeliveryConfig {
            claim_lease: Duration::from_secs(10),
            client_config: ClientConfig {
                timeout: Duration::from_secs(10),
                ..ClientConfig::default()
            },
            ..DeliveryConfig::default()
        };

        assert!(matches!(config.validate(), Err(DeliveryError::ConfigurationError { .. })));
        assert!(engine_with(config).is_err());
    }

    #[test]
    fn zero_sizes_rejected() {
        for config in [
            DeliveryConfig { batch_size: 0, ..DeliveryConfig::default() },
            DeliveryConfig { worker_count: 0, ..DeliveryConfig::default() },
            DeliveryConfig { poll_interval: Duration::ZERO, ..DeliveryConfig::default() },
            DeliveryConfig { retry_policy: RetryPolicy::new(0), ..DeliveryConfig::default() },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn terminal_snapshot_is_not_attempted() {
        let engine = engine_with(DeliveryConfig::default()).unwrap();
        let mut task = DeliveryTask::new("http://127.0.0.1:1/hook", Default::default(), chrono::Utc::now());
        task.status = TaskStatus::Succeeded;

        let err = engine.deliver_task(task).await.unwrap_err();

        assert!(matches!(err, DeliveryError::StaleTask { .. }));
        assert_eq!(engine.stats().await, EngineStats::default());
    }
}
