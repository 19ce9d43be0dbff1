//! Webhook delivery engine with at-least-once guarantees.
//!
//! This crate drives delivery tasks from the PostgreSQL task store to their
//! receivers: it claims due tasks, signs and POSTs each payload, classifies
//! the response, and moves the task to `succeeded`, back to `pending` with an
//! exponential backoff, or to `dead` once the attempt ceiling is reached.
//!
//! # Architecture
//!
//! One or more dispatch loops share a single [`DeliveryEngine`]. Each loop
//! runs a cycle immediately and then once per poll interval:
//!
//! 1. **Claim** - up to `batch_size` due tasks via `FOR UPDATE SKIP LOCKED`,
//!    leased so that no other claimer sees them while the attempt runs
//! 2. **Deliver** - every claimed task concurrently, signed with HMAC-SHA256
//! 3. **Record** - guarded state transition plus one attempt record per task
//!
//! Safety across loops and processes comes entirely from the claim protocol;
//! loops hold no per-task state between cycles.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{storage::Storage, PayloadSigner, RealClock};
//! use herald_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError, WorkerPool};
//! use sqlx::PgPool;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let clock = Arc::new(RealClock::new());
//! let storage = Arc::new(Storage::new(pool, clock.clone()));
//! let signer = PayloadSigner::new("shared-secret")
//!     .map_err(|e| DeliveryError::configuration(e.to_string()))?;
//! let config = DeliveryConfig::default();
//!
//! let engine =
//!     Arc::new(DeliveryEngine::with_postgres(storage, signer, config.clone(), clock.clone())?);
//! let mut workers = WorkerPool::new(engine, config.clone(), clock, CancellationToken::new());
//! workers.spawn_workers().await;
//! workers.shutdown_graceful(config.shutdown_timeout).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attempt_log;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod retry;
pub mod storage;
pub mod worker_pool;

pub use attempt_log::LoggingAttemptHandler;
pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use dispatcher::Dispatcher;
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use worker_pool::WorkerPool;

/// Default number of concurrent dispatch loops per process.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default number of tasks claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default attempt ceiling before a task is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default per-attempt HTTP timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default claim lease in seconds. Must exceed the HTTP timeout.
pub const DEFAULT_CLAIM_LEASE_SECONDS: u64 = 60;
